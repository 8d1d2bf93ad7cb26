use sync_api::SyncContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) sync: SyncContext,
}
