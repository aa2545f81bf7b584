use tryon_infra::service::{PollPolicy, TryOnService};

/// Everything handlers need, shared behind an `Arc`.
#[derive(Clone)]
pub struct AppServices {
    pub tryon: TryOnService,
    pub max_upload_bytes: usize,
    /// Advertised to clients that receive a `PROCESSING` answer.
    pub poll: PollPolicy,
}

impl AppServices {
    pub fn new(tryon: TryOnService, max_upload_bytes: usize) -> Self {
        Self {
            tryon,
            max_upload_bytes,
            poll: PollPolicy::default(),
        }
    }
}
