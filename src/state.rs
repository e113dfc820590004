use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::database::Database;
use crate::generation::GenerationManager;
use crate::kie::{KieClient, VideoModel};
use crate::server::UploadStore;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub generations: GenerationManager<KieClient>,
    pub uploads: UploadStore,
    pub selected_models: Arc<Mutex<HashMap<i64, VideoModel>>>,
}

impl AppState {
    pub fn new(
        db: Database,
        generations: GenerationManager<KieClient>,
        uploads: UploadStore,
    ) -> Self {
        AppState {
            db,
            generations,
            uploads,
            selected_models: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn selected_model(&self, user_id: i64) -> Option<VideoModel> {
        self.selected_models.lock().get(&user_id).copied()
    }

    pub fn select_model(&self, user_id: i64, model: VideoModel) {
        self.selected_models.lock().insert(user_id, model);
    }
}
