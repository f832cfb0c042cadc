//! Variable system: named text slots, image slots and model prompt state.
//!
//! - `store`: per-work-item `VariableStore` with identity fallback
//! - `image`: immutable RGBA images for the image slots
//! - `prompt`: conversation state for model calls

pub mod image;
pub mod prompt;
pub mod store;

pub use self::image::{Image, MAX_DIMENSION};
pub use prompt::{ChatMessage, ModelPrompt, Role};
pub use store::{DEFAULT_REQUIREMENTS, ImageSlot, KNOWN_VARIABLES, VariableStore};
