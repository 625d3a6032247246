use serde::Serialize;

use crate::config::PublicAppConfig;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextHealth {
    pub config: PublicAppConfig,
    pub auth_state: String,
    pub has_stored_session: bool,
    pub active_subscriptions: usize,
    pub saved_mirror_len: usize,
}

impl ContextHealth {
    pub fn new(
        config: PublicAppConfig,
        auth_state: impl Into<String>,
        has_stored_session: bool,
        active_subscriptions: usize,
        saved_mirror_len: usize,
    ) -> Self {
        Self {
            config,
            auth_state: auth_state.into(),
            has_stored_session,
            active_subscriptions,
            saved_mirror_len,
        }
    }
}
