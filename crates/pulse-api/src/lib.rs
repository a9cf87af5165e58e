pub mod conversations;
pub mod error;

use std::sync::Arc;

use pulse_db::Database;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
}
