//! Webhook subscription model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Webhook {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub url: String,
    /// Event names this subscription receives; empty or containing `"*"`
    /// means all events.
    #[builder(default)]
    pub events: Vec<String>,
    /// Extra headers sent with every delivery (e.g. a bearer token the
    /// receiving endpoint expects).
    #[builder(default)]
    pub headers: HashMap<String, String>,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default = 5)]
    pub max_retries: u32,
}

impl Webhook {
    pub fn subscribes_to(&self, event_name: &str) -> bool {
        self.enabled
            && (self.events.is_empty() || self.events.iter().any(|e| e == "*" || e == event_name))
    }
}
