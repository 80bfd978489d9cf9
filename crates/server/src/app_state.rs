use std::sync::Arc;

use server_api::ApiContext;

use crate::realtime::{PresenceRegistry, Realtime};

pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) realtime: Arc<Realtime>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let realtime = Arc::new(Realtime::new(api.clone(), presence));
        Self { api, realtime }
    }
}
