use std::fmt;

/// Video models offered in the model picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoModel {
    Veo3Fast,
    Kling21,
}

impl VideoModel {
    pub fn all() -> &'static [VideoModel] {
        &[VideoModel::Veo3Fast, VideoModel::Kling21]
    }

    pub fn key(self) -> &'static str {
        match self {
            VideoModel::Veo3Fast => "veo3_fast",
            VideoModel::Kling21 => "kling_v2.1",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VideoModel::Veo3Fast => "Veo 3 Fast - Quick generation",
            VideoModel::Kling21 => "Kling v2.1 - High quality",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        VideoModel::all()
            .iter()
            .copied()
            .find(|model| model.key() == key.trim())
    }
}

impl fmt::Display for VideoModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
