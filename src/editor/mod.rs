pub mod document;
pub mod placeholder;
pub mod preload;
pub mod queue;
pub mod uploads;

pub use document::{Document, ImageAttrs, Node, SharedDocument, Transaction};
pub use placeholder::{progress_label, PlaceholderRenderer, RasterPlaceholder};
pub use preload::{HttpPreloader, ImagePreloader, NoopPreloader};
pub use queue::MutationQueue;
pub use uploads::{AttachmentHandler, EditorUploads, ImageOutcome, PendingImage};
