//! Notification facade: the workflow engine's notification step calls
//! through here (§4.6), which durably records the notification and fans it
//! out on the account's realtime topic.

use std::sync::Arc;

use serde_json::json;

use crate::catalog::{Catalog, NotificationRecord};
use crate::error::Result;
use crate::pubsub::PubSub;

pub struct NotificationFacade {
    catalog: Arc<Catalog>,
    pubsub: Arc<PubSub>,
}

impl NotificationFacade {
    pub fn new(catalog: Arc<Catalog>, pubsub: Arc<PubSub>) -> Self {
        NotificationFacade { catalog, pubsub }
    }

    pub async fn notify(
        &self,
        tenant_id: &str,
        account_id: &str,
        subject: String,
        step: serde_json::Value,
    ) -> Result<NotificationRecord> {
        let record = self.catalog.insert_notification(NotificationRecord {
            id: String::new(),
            tenant_id: tenant_id.to_string(),
            account_id: account_id.to_string(),
            subject,
            step,
            read_marked: false,
            deleted: false,
        })?;

        let payload = json!({
            "id": record.id,
            "subject": record.subject,
            "step": record.step,
            "readMarked": record.read_marked,
            "deleted": record.deleted,
        });
        let data = serde_json::to_vec(&payload)?;
        let topic = format!("opennoty$/account/{account_id}/notification");
        self.pubsub.publish(tenant_id, &topic, data).await?;
        Ok(record)
    }
}
