//! Storage layout resolution.
//!
//! Two key layouts coexist in the originals bucket by historical necessity:
//!
//! - legacy:  `{slug}/{file}`
//! - current: `eventos/{slug}/original/{file}` with derived companion
//!   `eventos/{slug}/thumb/{base}.webp`
//!
//! The layout is never stored; readers resolve it here, trying current first
//! and falling back to legacy only when current yields nothing. Every
//! component goes through this module rather than re-implementing the
//! fallback.

use crate::error::Result;
use crate::object_store::ObjectStore;

/// Which key convention an event's originals live under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Current,
    Legacy,
}

/// Extension appended to derived assets
pub const DERIVED_EXT: &str = "webp";

/// Prefix under which an event's originals live for the given layout
pub fn original_prefix(layout: Layout, slug: &str) -> String {
    match layout {
        Layout::Current => format!("eventos/{slug}/original/"),
        Layout::Legacy => format!("{slug}/"),
    }
}

/// Prefix under which an event's derived assets live (always current layout)
pub fn thumb_prefix(slug: &str) -> String {
    format!("eventos/{slug}/thumb/")
}

/// Every namespace root the reaper must clear for an event, current first
pub fn namespace_roots(slug: &str) -> [String; 2] {
    [format!("eventos/{slug}/"), format!("{slug}/")]
}

/// Final path segment of an object key
pub fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Basename with its extension stripped
pub fn stem(key: &str) -> &str {
    let name = basename(key);
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// Derived-asset key for an original, regardless of the original's layout
pub fn thumb_key_for(slug: &str, original_key: &str) -> String {
    format!("{}{}.{}", thumb_prefix(slug), stem(original_key), DERIVED_EXT)
}

/// Original key under a given layout for a bare filename
pub fn original_key(layout: Layout, slug: &str, file: &str) -> String {
    format!("{}{}", original_prefix(layout, slug), file)
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

/// True when the key looks like a photo rather than a marker or sidecar
pub fn is_image_key(key: &str) -> bool {
    let name = basename(key);
    if name.is_empty() || name.starts_with('.') {
        return false;
    }
    matches!(
        name.rsplit('.').next().map(|e| e.to_ascii_lowercase()).as_deref(),
        Some("jpg" | "jpeg" | "png" | "webp" | "heic" | "tif" | "tiff")
    )
}

/// Resolve the layout an event's originals live under and list them.
///
/// Current layout is tried first; legacy only when current yields nothing.
/// Legacy keys nested deeper than one level under the slug belong to other
/// conventions and are skipped.
pub async fn resolve_originals(
    store: &dyn ObjectStore,
    slug: &str,
) -> Result<(Layout, Vec<String>)> {
    let current_prefix = original_prefix(Layout::Current, slug);
    let current: Vec<String> = store
        .list(&current_prefix)
        .await?
        .into_iter()
        .filter(|k| is_image_key(k))
        .collect();

    if !current.is_empty() {
        return Ok((Layout::Current, current));
    }

    let legacy_prefix = original_prefix(Layout::Legacy, slug);
    let legacy: Vec<String> = store
        .list(&legacy_prefix)
        .await?
        .into_iter()
        .filter(|k| is_image_key(k) && !k[legacy_prefix.len()..].contains('/'))
        .collect();

    Ok((Layout::Legacy, legacy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_original_prefix_layouts() {
        assert_eq!(original_prefix(Layout::Current, "boda-2024"), "eventos/boda-2024/original/");
        assert_eq!(original_prefix(Layout::Legacy, "boda-2024"), "boda-2024/");
    }

    #[test]
    fn test_thumb_key_strips_extension() {
        assert_eq!(
            thumb_key_for("boda-2024", "eventos/boda-2024/original/IMG_0101.JPG"),
            "eventos/boda-2024/thumb/IMG_0101.webp"
        );
        // Legacy originals still land under the current thumb namespace
        assert_eq!(
            thumb_key_for("boda-2024", "boda-2024/IMG_0101.jpg"),
            "eventos/boda-2024/thumb/IMG_0101.webp"
        );
    }

    #[test]
    fn test_stem_edge_cases() {
        assert_eq!(stem("a/b/photo.jpg"), "photo");
        assert_eq!(stem("photo"), "photo");
        assert_eq!(stem("archive.tar.gz"), "archive.tar");
        // A leading dot is not an extension separator
        assert_eq!(stem(".hidden"), ".hidden");
    }

    #[test]
    fn test_namespace_roots_order() {
        let roots = namespace_roots("gala");
        assert_eq!(roots[0], "eventos/gala/");
        assert_eq!(roots[1], "gala/");
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("IMG_0101.jpg"), "IMG_0101.jpg");
        assert_eq!(sanitize_path_component("../../etc/passwd"), ".._.._etc_passwd");
    }

    #[test]
    fn test_is_image_key() {
        assert!(is_image_key("eventos/gala/original/a.JPG"));
        assert!(is_image_key("gala/b.jpeg"));
        assert!(!is_image_key("eventos/gala/original/.keep"));
        assert!(!is_image_key("gala/notes.txt"));
    }

    mod resolve {
        use super::*;
        use crate::object_store::testing::InMemoryStore;

        #[tokio::test]
        async fn test_current_layout_wins_when_populated() {
            let store = InMemoryStore::with_objects(&[
                ("eventos/gala/original/a.jpg", b"a".as_slice()),
                ("gala/stale.jpg", b"s".as_slice()),
            ]);

            let (layout, keys) = resolve_originals(&store, "gala").await.unwrap();
            assert_eq!(layout, Layout::Current);
            assert_eq!(keys, vec!["eventos/gala/original/a.jpg".to_string()]);
        }

        #[tokio::test]
        async fn test_falls_back_to_legacy_when_current_empty() {
            let store = InMemoryStore::with_objects(&[
                ("gala/a.jpg", b"a".as_slice()),
                // Nested keys belong to other conventions
                ("gala/sub/b.jpg", b"b".as_slice()),
            ]);

            let (layout, keys) = resolve_originals(&store, "gala").await.unwrap();
            assert_eq!(layout, Layout::Legacy);
            assert_eq!(keys, vec!["gala/a.jpg".to_string()]);
        }

        #[tokio::test]
        async fn test_both_layouts_empty_is_nothing_to_do() {
            let store = InMemoryStore::default();
            let (layout, keys) = resolve_originals(&store, "gala").await.unwrap();
            assert_eq!(layout, Layout::Legacy);
            assert!(keys.is_empty());
        }
    }
}
