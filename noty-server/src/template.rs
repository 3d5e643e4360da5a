//! Template rendering and the i18n store (§4.8). The original's rendering
//! engine and locale store are opaque collaborators (§1: `Render(template,
//! context) -> string`); this module is the concrete seam the workflow
//! engine's notification/email steps call through, backed by `tera`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::catalog::Catalog;
use crate::error::{Error, Result};

pub struct Templates {
    catalog: Arc<Catalog>,
    fallback_locale: String,
    i18n: RwLock<HashMap<(String, String), String>>,
}

impl Templates {
    pub fn new(catalog: Arc<Catalog>, fallback_locale: impl Into<String>) -> Result<Self> {
        let templates = Templates { catalog, fallback_locale: fallback_locale.into(), i18n: RwLock::new(HashMap::new()) };
        templates.reload()?;
        Ok(templates)
    }

    /// Rebuilds the in-memory locale table from the catalog; this is what
    /// `GET /reload/i18n` asks for.
    pub fn reload(&self) -> Result<()> {
        let rows = self.catalog.all_i18n()?;
        let mut table = HashMap::with_capacity(rows.len());
        for (locale, key, value) in rows {
            table.insert((locale, key), value);
        }
        *self.i18n.write() = table;
        Ok(())
    }

    pub fn resolve(&self, locale: &str, key: &str) -> String {
        let table = self.i18n.read();
        table
            .get(&(locale.to_string(), key.to_string()))
            .or_else(|| table.get(&(self.fallback_locale.clone(), key.to_string())))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    pub fn render(&self, template: &str, ctx: &impl Serialize) -> Result<String> {
        let tera_ctx = tera::Context::from_serialize(ctx).map_err(Error::from)?;
        tera::Tera::one_off(template, &tera_ctx, false).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_inline_template_with_context() {
        let catalog = Arc::new(Catalog::open(":memory:").unwrap());
        let templates = Templates::new(catalog, "en-US").unwrap();
        let out = templates
            .render("Today, {{ subscriber.fullName }}'s activities: {{ step.totalCount }}", &json!({
                "subscriber": {"fullName": "Ada"},
                "step": {"totalCount": 3},
            }))
            .unwrap();
        assert_eq!(out, "Today, Ada's activities: 3");
    }
}
