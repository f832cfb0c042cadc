//! Inline variable operations, applied at dispatch time.
//!
//! Operations run against the work item arena rather than a single store
//! because linked `temp1`/`temp2` slots read and write another item's
//! visible image.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::work_item::{WorkItem, WorkItemId};
use crate::error::VarError;
use crate::steps::VarOp;
use crate::vars::{Image, ImageSlot, MAX_DIMENSION};

/// Opaque white, used for generated masks.
const MASK_FILL: [u8; 4] = [255, 255, 255, 255];

/// Apply `ops` in order to work item `id`. Failures are logged and the
/// offending operation is skipped.
pub(crate) fn apply(items: &mut BTreeMap<WorkItemId, WorkItem>, id: WorkItemId, ops: &[VarOp]) {
    for op in ops {
        if let Err(e) = apply_one(items, id, op) {
            warn!(work_item = %id, ?op, error = %e, "Variable operation skipped");
        }
    }
}

fn apply_one(
    items: &mut BTreeMap<WorkItemId, WorkItem>,
    id: WorkItemId,
    op: &VarOp,
) -> Result<(), VarError> {
    match op {
        VarOp::Copy { src, dst } => {
            match (ImageSlot::from_name(src), ImageSlot::from_name(dst)) {
                (Some(from), Some(to)) => {
                    let image = read_image(items, id, from)?.ok_or(VarError::MissingImage(from))?;
                    write_image(items, id, to, image)?;
                }
                _ => {
                    if let Some(item) = items.get_mut(&id) {
                        item.vars.copy(src, dst)?;
                    }
                }
            }
        }
        VarOp::Append { src, dst } => {
            if let Some(item) = items.get_mut(&id) {
                item.vars.append(src, dst);
            }
        }
        VarOp::Resize {
            width,
            height,
            aspect_correct,
            only_if_larger,
        } => {
            if *width > MAX_DIMENSION || *height > MAX_DIMENSION {
                return Err(VarError::DimensionTooLarge {
                    width: *width,
                    height: *height,
                    max: MAX_DIMENSION,
                });
            }
            let Some(item) = items.get_mut(&id) else {
                return Ok(());
            };
            let image = item
                .vars
                .image(ImageSlot::Image)
                .ok_or(VarError::MissingImage(ImageSlot::Image))?;
            if *only_if_larger && !image.is_larger_than(*width, *height) {
                debug!(work_item = %id, "Image already within bounds, not resizing");
                return Ok(());
            }
            let resized = image.resized(*width, *height, *aspect_correct);
            item.vars.set_image(ImageSlot::Image, resized);
        }
        VarOp::FillMaskIfBlank => {
            let Some(item) = items.get_mut(&id) else {
                return Ok(());
            };
            let image = item
                .vars
                .image(ImageSlot::Image)
                .ok_or(VarError::MissingImage(ImageSlot::Image))?;
            let (width, height) = (image.width(), image.height());
            let blank = item
                .vars
                .image(ImageSlot::Mask)
                .is_none_or(Image::is_fully_transparent);
            if blank {
                item.vars
                    .set_image(ImageSlot::Mask, Image::solid(width, height, MASK_FILL));
            }
        }
        VarOp::NoUndo => {}
        VarOp::ModelPromptReset => {
            if let Some(item) = items.get_mut(&id) {
                item.prompt.reset();
            }
        }
        VarOp::ModelPromptSetBasePrompt { source } => {
            if let Some(item) = items.get_mut(&id) {
                let text = item.vars.resolve(source);
                item.prompt.set_base_prompt(text);
            }
        }
        VarOp::ModelPromptAddFromAssistant { source } => {
            if let Some(item) = items.get_mut(&id) {
                let text = item.vars.resolve(source);
                item.prompt.add_assistant(text);
            }
        }
        VarOp::ModelPromptAddFromUser { source } => {
            if let Some(item) = items.get_mut(&id) {
                let text = item.vars.resolve(source);
                item.prompt.add_user(text);
            }
        }
    }
    Ok(())
}

/// Read an image slot, following a `temp` link to the linked item's image.
pub(crate) fn read_image(
    items: &BTreeMap<WorkItemId, WorkItem>,
    id: WorkItemId,
    slot: ImageSlot,
) -> Result<Option<Image>, VarError> {
    let Some(item) = items.get(&id) else {
        return Ok(None);
    };
    match item.links.get(&slot) {
        Some(&linked) => items
            .get(&linked)
            .map(|other| other.vars.image(ImageSlot::Image).cloned())
            .ok_or(VarError::DanglingLink(linked)),
        None => Ok(item.vars.image(slot).cloned()),
    }
}

/// Write an image slot. A linked `temp` slot replaces the linked item's
/// visible image.
fn write_image(
    items: &mut BTreeMap<WorkItemId, WorkItem>,
    id: WorkItemId,
    slot: ImageSlot,
    image: Image,
) -> Result<(), VarError> {
    let (target, target_slot) = match items.get(&id).and_then(|item| item.links.get(&slot)) {
        Some(&linked) => (linked, ImageSlot::Image),
        None => (id, slot),
    };
    let item = items
        .get_mut(&target)
        .ok_or(VarError::DanglingLink(target))?;
    item.vars.set_image(target_slot, image);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> BTreeMap<WorkItemId, WorkItem> {
        let mut items = BTreeMap::new();
        items.insert(WorkItemId(1), WorkItem::new(WorkItemId(1), "a", 10));
        items.insert(WorkItemId(2), WorkItem::new(WorkItemId(2), "b", 10));
        items
    }

    fn copy(src: &str, dst: &str) -> VarOp {
        VarOp::Copy {
            src: src.into(),
            dst: dst.into(),
        }
    }

    #[test]
    fn text_copy_and_append() {
        let mut items = arena();
        let id = WorkItemId(1);
        items.get_mut(&id).unwrap().vars.set("prompt", "cat");
        apply(
            &mut items,
            id,
            &[
                copy("prompt", "negative_prompt"),
                VarOp::Append {
                    src: " on a mat".into(),
                    dst: "prompt".into(),
                },
            ],
        );
        let vars = &items[&id].vars;
        assert_eq!(vars.resolve("negative_prompt"), "cat");
        assert_eq!(vars.resolve("prompt"), "cat on a mat");
    }

    #[test]
    fn linked_temp_reads_other_item() {
        let mut items = arena();
        let red = Image::solid(4, 4, [255, 0, 0, 255]);
        items
            .get_mut(&WorkItemId(2))
            .unwrap()
            .vars
            .set_image(ImageSlot::Image, red.clone());
        items
            .get_mut(&WorkItemId(1))
            .unwrap()
            .links
            .insert(ImageSlot::Temp1, WorkItemId(2));

        apply(&mut items, WorkItemId(1), &[copy("temp1", "image")]);
        assert_eq!(items[&WorkItemId(1)].vars.image(ImageSlot::Image), Some(&red));
    }

    #[test]
    fn linked_temp_writes_other_item() {
        let mut items = arena();
        let blue = Image::solid(2, 2, [0, 0, 255, 255]);
        let a = items.get_mut(&WorkItemId(1)).unwrap();
        a.vars.set_image(ImageSlot::Image, blue.clone());
        a.links.insert(ImageSlot::Temp2, WorkItemId(2));

        apply(&mut items, WorkItemId(1), &[copy("image", "temp2")]);
        assert_eq!(items[&WorkItemId(2)].vars.image(ImageSlot::Image), Some(&blue));
    }

    #[test]
    fn missing_image_is_skipped() {
        let mut items = arena();
        items.get_mut(&WorkItemId(1)).unwrap().vars.set("prompt", "x");
        apply(
            &mut items,
            WorkItemId(1),
            &[copy("temp2", "image"), copy("prompt", "audio_prompt")],
        );
        let vars = &items[&WorkItemId(1)].vars;
        assert!(vars.image(ImageSlot::Image).is_none());
        // Later operations still run.
        assert_eq!(vars.resolve("audio_prompt"), "x");
    }

    #[test]
    fn oversized_resize_leaves_image_untouched() {
        let mut items = arena();
        let id = WorkItemId(1);
        let original = Image::solid(8, 4, [9, 9, 9, 255]);
        items
            .get_mut(&id)
            .unwrap()
            .vars
            .set_image(ImageSlot::Image, original.clone());

        let huge = VarOp::Resize {
            width: 100_000,
            height: 100_000,
            aspect_correct: false,
            only_if_larger: false,
        };
        assert_eq!(
            apply_one(&mut items, id, &huge),
            Err(VarError::DimensionTooLarge {
                width: 100_000,
                height: 100_000,
                max: MAX_DIMENSION,
            })
        );
        apply(&mut items, id, &[huge]);
        assert_eq!(items[&id].vars.image(ImageSlot::Image), Some(&original));
    }

    #[test]
    fn resize_if_larger_only_shrinks() {
        let mut items = arena();
        let id = WorkItemId(1);
        items
            .get_mut(&id)
            .unwrap()
            .vars
            .set_image(ImageSlot::Image, Image::solid(8, 4, [9, 9, 9, 255]));

        let grow = VarOp::Resize {
            width: 16,
            height: 16,
            aspect_correct: true,
            only_if_larger: true,
        };
        apply(&mut items, id, &[grow]);
        assert_eq!(items[&id].vars.image(ImageSlot::Image).unwrap().width(), 8);

        let shrink = VarOp::Resize {
            width: 4,
            height: 4,
            aspect_correct: true,
            only_if_larger: true,
        };
        apply(&mut items, id, &[shrink]);
        let image = items[&id].vars.image(ImageSlot::Image).unwrap();
        assert_eq!((image.width(), image.height()), (4, 2));
    }

    #[test]
    fn fill_mask_when_blank() {
        let mut items = arena();
        let id = WorkItemId(1);
        let vars = &mut items.get_mut(&id).unwrap().vars;
        vars.set_image(ImageSlot::Image, Image::solid(3, 2, [1, 1, 1, 255]));
        vars.set_image(ImageSlot::Mask, Image::solid(3, 2, [0, 0, 0, 0]));

        apply(&mut items, id, &[VarOp::FillMaskIfBlank]);
        let mask = items[&id].vars.image(ImageSlot::Mask).unwrap();
        assert!(!mask.is_fully_transparent());
        assert_eq!((mask.width(), mask.height()), (3, 2));
    }

    #[test]
    fn model_prompt_ops() {
        let mut items = arena();
        let id = WorkItemId(1);
        items.get_mut(&id).unwrap().vars.set("prompt", "describe a fox");
        apply(
            &mut items,
            id,
            &[
                VarOp::ModelPromptReset,
                VarOp::ModelPromptSetBasePrompt {
                    source: "You write image prompts.".into(),
                },
                VarOp::ModelPromptAddFromUser {
                    source: "prompt".into(),
                },
            ],
        );
        let messages = items[&id].prompt.to_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "describe a fox");
    }
}
