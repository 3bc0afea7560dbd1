//! Content type normalisation of written targets.

use url::Url;

use crate::codec;
use crate::storage::FileInfo;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const COG_CONTENT_TYPE: &str = "image/tiff; application=geotiff; profile=cloud-optimized";
pub const GEOJSON_CONTENT_TYPE: &str = "application/geo+json";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Generic types that may be replaced by one derived from the file extension.
const FIXABLE_CONTENT_TYPES: [&str; 2] = ["binary/octet-stream", OCTET_STREAM];

fn has_extension(url: &Url, extensions: &[&str]) -> bool {
    let path = url.path().to_ascii_lowercase();
    extensions.iter().any(|extension| path.ends_with(extension))
}

/// Content type a file written to `target` should carry given the type of its source.
pub fn fix_content_type(target: &Url, content_type: Option<&str>) -> Option<String> {
    if target.path().ends_with(codec::COMPRESSED_SUFFIX) {
        return Some(codec::COMPRESSED_CONTENT_TYPE.to_string());
    }
    let content_type = match content_type {
        Some(codec::COMPRESSED_CONTENT_TYPE) => Some(OCTET_STREAM),
        other => other,
    };
    if content_type.is_some_and(|current| !FIXABLE_CONTENT_TYPES.contains(&current)) {
        return content_type.map(String::from);
    }
    let fixed = if has_extension(target, &[".tif", ".tiff"]) {
        Some(COG_CONTENT_TYPE)
    } else if has_extension(target, &[".geojson"]) {
        Some(GEOJSON_CONTENT_TYPE)
    } else if has_extension(target, &[".json"]) {
        Some(JSON_CONTENT_TYPE)
    } else {
        content_type
    };
    fixed.map(String::from)
}

/// Describes the file `source` becomes once written to `target` as-is.
///
/// Content type and user metadata are carried over except for the content hash, which belongs
/// to the source bytes.
pub fn carry_metadata(target: &Url, source: &FileInfo) -> FileInfo {
    let metadata = source.metadata.as_ref().map(|metadata| {
        let mut metadata = metadata.clone();
        metadata.remove(crate::hash::HASH_KEY);
        metadata
    });
    FileInfo {
        url: target.clone(),
        size: source.size,
        content_type: source.content_type.clone(),
        metadata,
    }
}

/// Like [`carry_metadata`] with the content type fixed for `target`.
pub fn fix_metadata(target: &Url, source: &FileInfo) -> FileInfo {
    let mut fixed = carry_metadata(target, source);
    fixed.content_type = fix_content_type(target, source.content_type.as_deref());
    if fixed.content_type != source.content_type {
        tracing::debug!(
            "content type of {} changed from {:?} to {:?}",
            target,
            source.content_type,
            fixed.content_type
        );
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse(&format!("memory://bucket/{path}")).unwrap()
    }

    #[test]
    fn json_gets_json_type() {
        assert_eq!(
            fix_content_type(&url("a.json"), Some(OCTET_STREAM)).as_deref(),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            fix_content_type(&url("a.geojson"), Some("binary/octet-stream")).as_deref(),
            Some(GEOJSON_CONTENT_TYPE)
        );
    }

    #[test]
    fn tiff_gets_cog_type_case_insensitive() {
        for name in ["a.tif", "a.tiff", "A.TIFF", "b.TiF"] {
            assert_eq!(
                fix_content_type(&url(name), Some("binary/octet-stream")).as_deref(),
                Some(COG_CONTENT_TYPE),
                "{name}"
            );
        }
    }

    #[test]
    fn compressed_target_always_zstd() {
        assert_eq!(
            fix_content_type(&url("a.json.zst"), Some(JSON_CONTENT_TYPE)).as_deref(),
            Some(codec::COMPRESSED_CONTENT_TYPE)
        );
    }

    #[test]
    fn decompressed_target_loses_zstd_type() {
        assert_eq!(
            fix_content_type(&url("a.bin"), Some(codec::COMPRESSED_CONTENT_TYPE)).as_deref(),
            Some(OCTET_STREAM)
        );
        assert_eq!(
            fix_content_type(&url("a.tiff"), Some(codec::COMPRESSED_CONTENT_TYPE)).as_deref(),
            Some(COG_CONTENT_TYPE)
        );
    }

    #[test]
    fn specific_types_are_kept() {
        assert_eq!(
            fix_content_type(&url("a.json"), Some("text/plain")).as_deref(),
            Some("text/plain")
        );
    }

    #[test]
    fn missing_type_is_fixable() {
        assert_eq!(
            fix_content_type(&url("a.json"), None).as_deref(),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(fix_content_type(&url("a.txt"), None), None);
    }

    #[test]
    fn fix_metadata_drops_source_hash() {
        let mut source = FileInfo::new(url("src/a.json"), 2);
        source.metadata = Some(
            [
                (crate::hash::HASH_KEY.to_string(), "1220ab".to_string()),
                ("owner".to_string(), "me".to_string()),
            ]
            .into(),
        );
        let fixed = fix_metadata(&url("dst/a.json"), &source);
        assert_eq!(fixed.url, url("dst/a.json"));
        assert_eq!(fixed.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        let metadata = fixed.metadata.unwrap();
        assert!(!metadata.contains_key(crate::hash::HASH_KEY));
        assert_eq!(metadata.get("owner").map(String::as_str), Some("me"));
    }
}
