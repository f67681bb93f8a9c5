use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::messaging::layers::DeliveryHandler;

/// Application consumer that records every delivered payload in order, for assertions
///  on exactly-once and ordering behavior.
pub struct RecordingDeliveryHandler {
    deliveries: Mutex<Vec<String>>,
}

impl RecordingDeliveryHandler {
    pub fn new() -> Arc<RecordingDeliveryHandler> {
        Arc::new(RecordingDeliveryHandler {
            deliveries: Mutex::new(Vec::new()),
        })
    }

    pub fn deliveries(&self) -> Vec<String> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryHandler for RecordingDeliveryHandler {
    async fn on_delivery(&self, payload: &str) {
        self.deliveries.lock().unwrap().push(payload.to_string());
    }
}
