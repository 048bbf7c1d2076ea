use serde::{Deserialize, Serialize};

/// Type tags the host application uses for still images.
const IMAGE_UTIS: &[&str] = &[
    "public.png",
    "public.jpeg",
    "public.heic",
    "public.tiff",
    "com.compuserve.gif",
    "com.microsoft.bmp",
];

/// A file attached to a message, cached locally by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    rowid: i64,
    pub guid: String,
    /// Local cache path once downloaded, the remote path before that.
    pub filename: Option<String>,
    /// UTI or MIME type reported by the source.
    pub uti: Option<String>,
}

impl Attachment {
    pub fn new(rowid: i64) -> Self {
        Self {
            rowid,
            guid: String::new(),
            filename: None,
            uti: None,
        }
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = guid.into();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_uti(mut self, uti: impl Into<String>) -> Self {
        self.uti = Some(uti.into());
        self
    }

    pub fn rowid(&self) -> i64 {
        self.rowid
    }

    /// Whether a client can render this attachment inline as an image.
    pub fn is_image(&self) -> bool {
        match self.uti.as_deref() {
            Some(tag) => tag.starts_with("image/") || IMAGE_UTIS.contains(&tag),
            None => false,
        }
    }
}
