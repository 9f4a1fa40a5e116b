use serde::{Deserialize, Serialize};

/// A named lane of change data with its own batching policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub processing_order: i32,
    pub max_batch_size: i32,
    pub max_batch_to_send: i32,
    pub max_data_to_route: i32,
    pub enabled: bool,
    pub use_old_data_to_route: bool,
    pub use_row_data_to_route: bool,
    pub use_pk_data_to_route: bool,
    pub reload_flag: bool,
    pub batch_algorithm: String,
    pub description: Option<String>,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, processing_order: i32) -> Self {
        Self {
            channel_id: channel_id.into(),
            processing_order,
            max_batch_size: 1000,
            max_batch_to_send: 60,
            max_data_to_route: 100_000,
            enabled: true,
            use_old_data_to_route: true,
            use_row_data_to_route: true,
            use_pk_data_to_route: true,
            reload_flag: false,
            batch_algorithm: "default".to_string(),
            description: None,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: i32) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn reload(mut self) -> Self {
        self.reload_flag = true;
        self
    }
}
