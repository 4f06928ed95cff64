use crate::license::LicenseExchanger;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone)]
pub struct AppState {
    pub(crate) license_exchanger: Arc<dyn LicenseExchanger>,
    console_ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(license_exchanger: Arc<dyn LicenseExchanger>) -> Self {
        Self {
            license_exchanger,
            console_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_console_ready(&self) {
        self.console_ready.store(true, Ordering::Release);
    }

    pub fn is_console_ready(&self) -> bool {
        self.console_ready.load(Ordering::Acquire)
    }
}
