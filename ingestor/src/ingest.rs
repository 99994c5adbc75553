use crate::db::Store;
use crate::errors::Result;
use crate::model::{DeviceStatus, SubmitOutcome};
use crate::validate::{is_boot_notification, parse_reading, source};
use std::collections::HashMap;
use std::sync::Arc;

const ONLINE: &str = "online";
const ERROR: &str = "error";

/// Turns raw device submissions into stored readings and device-status updates.
#[derive(Clone)]
pub struct IngestService {
    store: Arc<Store>,
}

impl IngestService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Handles one submission.
    ///
    /// Boot notifications skip validation and only bump the device's boot
    /// counter. Anything else is validated before the store is touched; an
    /// accepted reading and its device-status update commit together.
    pub async fn submit_reading(&self, params: &HashMap<String, String>) -> Result<SubmitOutcome> {
        let source = source(params);
        if is_boot_notification(source) {
            self.store
                .update_device_status(source, ONLINE, true, false)
                .await?;
            return Ok(SubmitOutcome::BootAcknowledged);
        }

        let reading = parse_reading(params)?;
        let inserted = self.store.insert_reading(&reading).await?;

        Ok(SubmitOutcome::Accepted(inserted))
    }

    /// Counts a failure against `source` and marks it as erroring.
    pub async fn report_device_error(&self, source: &str) -> Result<DeviceStatus> {
        self.store
            .update_device_status(source, ERROR, false, true)
            .await
    }
}
