//! BDX image URIs handed to requestors

use crate::identity::NodeId;

pub const BDX_SCHEME: &str = "bdx://";
pub const MAX_IMAGE_URI_LEN: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UriError {
    #[error("image URI would be {len} bytes, limit is {max}", max = MAX_IMAGE_URI_LEN)]
    TooLong { len: usize },
}

/// `bdx://<provider node id as 16 upper-case hex digits>/<file name>`
///
/// `file_name` must already have its directory part stripped, see
/// [`file_name_from_url`].
pub fn build_image_uri(provider_node_id: NodeId, file_name: &str) -> Result<String, UriError> {
    let len = BDX_SCHEME.len() + 16 + 1 + file_name.len();
    if len > MAX_IMAGE_URI_LEN {
        return Err(UriError::TooLong { len });
    }
    Ok(format!("{BDX_SCHEME}{provider_node_id:016X}/{file_name}"))
}

/// Everything after the last `/` of a fetch URL
pub fn file_name_from_url(url: &str) -> &str {
    match url.rsplit_once('/') {
        Some((_, name)) => name,
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_bdx_uri() {
        assert_eq!(
            build_image_uri(0x1122_3344_5566_77AA, "fw.bin").unwrap(),
            "bdx://11223344556677AA/fw.bin"
        );
        assert_eq!(build_image_uri(0xAA, "fw.bin").unwrap(), "bdx://00000000000000AA/fw.bin");
    }

    #[test]
    fn strips_directories() {
        assert_eq!(file_name_from_url("https://x/fw.bin"), "fw.bin");
        assert_eq!(file_name_from_url("https://dl.example.com/a/b/c/image.ota"), "image.ota");
        assert_eq!(file_name_from_url("fw.bin"), "fw.bin");
        assert_eq!(file_name_from_url("https://x/dir/"), "");
    }

    #[test]
    fn length_limit() {
        // scheme + 16 hex digits + separator
        let room = MAX_IMAGE_URI_LEN - BDX_SCHEME.len() - 17;
        let fits = "a".repeat(room);
        assert_eq!(build_image_uri(1, &fits).unwrap().len(), MAX_IMAGE_URI_LEN);

        let too_long = "a".repeat(room + 1);
        assert_eq!(
            build_image_uri(1, &too_long),
            Err(UriError::TooLong { len: MAX_IMAGE_URI_LEN + 1 })
        );
    }
}
