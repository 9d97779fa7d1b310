//! Workload image selection.

use crate::provider::RegistryImage;

/// Tag preferred over every other tag.
pub const PREFERRED_TAG: &str = "latest";

/// Picks the tag to deploy: `latest` when present, otherwise a tag of the
/// most recently pushed tagged image. Untagged images cannot be pulled by
/// tag and are ignored.
#[must_use]
pub fn select_tag(images: &[RegistryImage]) -> Option<String> {
    let tagged = images.iter().filter(|image| !image.tags.is_empty());
    if tagged
        .clone()
        .any(|image| image.tags.iter().any(|tag| tag == PREFERRED_TAG))
    {
        return Some(PREFERRED_TAG.to_owned());
    }
    tagged
        .max_by_key(|image| image.pushed_at)
        .and_then(|image| image.tags.first().cloned())
}

/// Returns `true` when pull output shows the image reference does not
/// exist in the registry.
#[must_use]
pub fn reports_missing_image(output: &str, image_uri: &str) -> bool {
    output.lines().any(|line| {
        let lowered = line.to_ascii_lowercase();
        lowered.contains("manifest unknown")
            || (lowered.contains("not found") && line.contains(image_uri))
    })
}
