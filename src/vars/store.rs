//! Per-work-item variable store.
//!
//! Reads of a name that was never registered return the name itself, so
//! `copy|cat|prompt` writes the literal text `cat` into `prompt`. Existing
//! step scripts depend on this.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::image::Image;
use crate::error::VarError;

/// Text variables every store starts with.
pub const KNOWN_VARIABLES: &[&str] = &[
    "prompt",
    "negative_prompt",
    "audio_prompt",
    "model_reply",
    "requirements",
    "input1",
    "input2",
    "input3",
    "input4",
];

/// Default value of the `requirements` tag: the item needs a compute backend.
pub const DEFAULT_REQUIREMENTS: &str = "resource";

/// Image-valued slots. Copies between these move image buffers, not text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSlot {
    /// The work item's visible image.
    Image,
    Temp1,
    Temp2,
    Mask,
}

impl ImageSlot {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "image" => Some(Self::Image),
            "temp1" => Some(Self::Temp1),
            "temp2" => Some(Self::Temp2),
            "mask" => Some(Self::Mask),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Temp1 => "temp1",
            Self::Temp2 => "temp2",
            Self::Mask => "mask",
        }
    }
}

impl std::fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Named text and image slots owned by one work item.
#[derive(Debug, Clone)]
pub struct VariableStore {
    text: HashMap<String, String>,
    images: HashMap<ImageSlot, Image>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableStore {
    /// Create a store with every known variable registered.
    pub fn new() -> Self {
        let mut text: HashMap<String, String> = KNOWN_VARIABLES
            .iter()
            .map(|name| (name.to_string(), String::new()))
            .collect();
        text.insert("requirements".to_string(), DEFAULT_REQUIREMENTS.to_string());
        Self {
            text,
            images: HashMap::new(),
        }
    }

    /// Value of `name`, or `name` itself when it is not a registered variable.
    pub fn resolve(&self, name: &str) -> String {
        match self.text.get(name) {
            Some(value) => value.clone(),
            None => name.to_string(),
        }
    }

    /// Value of a registered variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.text.get(name).map(String::as_str)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.text.contains_key(name)
    }

    /// Set (and register, if new) a text variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.text.insert(name.into(), value.into());
    }

    /// `dst = resolve(src)`. Between two image slots the image is duplicated.
    pub fn copy(&mut self, src: &str, dst: &str) -> Result<(), VarError> {
        if let (Some(from), Some(to)) = (ImageSlot::from_name(src), ImageSlot::from_name(dst)) {
            let image = self.images.get(&from).cloned().ok_or(VarError::MissingImage(from))?;
            self.images.insert(to, image);
            return Ok(());
        }
        let value = self.resolve(src);
        self.set(dst, value);
        Ok(())
    }

    /// `dst = dst + resolve(src)`.
    pub fn append(&mut self, src: &str, dst: &str) {
        let value = self.resolve(src);
        self.text.entry(dst.to_string()).or_default().push_str(&value);
    }

    pub fn image(&self, slot: ImageSlot) -> Option<&Image> {
        self.images.get(&slot)
    }

    /// Replace an image slot, returning the previous image.
    pub fn set_image(&mut self, slot: ImageSlot, image: Image) -> Option<Image> {
        self.images.insert(slot, image)
    }

    /// The `requirements` tag as currently set.
    pub fn requirements(&self) -> &str {
        self.get("requirements").unwrap_or("")
    }

    /// Copy of every text binding, taken at dispatch time.
    pub fn text_bindings(&self) -> HashMap<String, String> {
        self.text.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_token_resolves_to_itself() {
        let store = VariableStore::new();
        assert_eq!(store.resolve("unregistered_token"), "unregistered_token");
    }

    #[test]
    fn known_variables_start_empty() {
        let store = VariableStore::new();
        assert_eq!(store.resolve("prompt"), "");
        assert_eq!(store.requirements(), DEFAULT_REQUIREMENTS);
    }

    #[test]
    fn copy_between_variables() {
        let mut store = VariableStore::new();
        store.set("prompt", "cat");
        store.copy("prompt", "negative_prompt").unwrap();
        assert_eq!(store.resolve("negative_prompt"), "cat");
    }

    #[test]
    fn copy_literal_when_source_unknown() {
        let mut store = VariableStore::new();
        store.copy("a watercolor fox", "prompt").unwrap();
        assert_eq!(store.resolve("prompt"), "a watercolor fox");
    }

    #[test]
    fn copy_into_new_name_registers_it() {
        let mut store = VariableStore::new();
        store.copy("hello", "scratch").unwrap();
        assert!(store.is_registered("scratch"));
        assert_eq!(store.resolve("scratch"), "hello");
    }

    #[test]
    fn append_concatenates() {
        let mut store = VariableStore::new();
        store.set("prompt", "cat");
        store.set("model_reply", ", sitting on a mat");
        store.append("model_reply", "prompt");
        assert_eq!(store.resolve("prompt"), "cat, sitting on a mat");
    }

    #[test]
    fn clearing_requirements() {
        let mut store = VariableStore::new();
        store.copy("", "requirements").unwrap();
        assert_eq!(store.requirements(), "");
    }

    #[test]
    fn image_copy_duplicates_buffer() {
        let mut store = VariableStore::new();
        let img = Image::solid(2, 2, [1, 2, 3, 255]);
        store.set_image(ImageSlot::Image, img.clone());
        store.copy("image", "temp1").unwrap();
        assert_eq!(store.image(ImageSlot::Temp1), Some(&img));

        // Replacing the source leaves the copy intact.
        store.set_image(ImageSlot::Image, Image::solid(1, 1, [0, 0, 0, 0]));
        assert_eq!(store.image(ImageSlot::Temp1), Some(&img));
    }

    #[test]
    fn copy_from_empty_image_slot_is_an_error() {
        let mut store = VariableStore::new();
        let result = store.copy("temp2", "image");
        assert_eq!(result, Err(VarError::MissingImage(ImageSlot::Temp2)));
        assert!(store.image(ImageSlot::Image).is_none());
    }
}
