/// Number of leading characters of a container id used as its registry key.
pub const KEY_LEN: usize = 10;

/// Returns the first [`KEY_LEN`] characters of `name`, or all of it when shorter.
pub fn truncate(name: &str) -> &str {
    match name.char_indices().nth(KEY_LEN) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

/// Strips the tag or digest from an image reference.
///
/// A colon followed by a `/` belongs to a registry port, not a tag, so
/// `localhost:5000/app:1.0` becomes `localhost:5000/app`.
pub fn remove_tag(image: &str) -> &str {
    let image = match image.find('@') {
        Some(at_pos) => &image[..at_pos],
        None => image,
    };
    match image.rfind(':') {
        Some(colon_pos) if !image[colon_pos + 1..].contains('/') => &image[..colon_pos],
        _ => image,
    }
}

pub fn remove_slash(name: &str) -> String {
    name.replace('/', "")
}

/// Service name for an image: the repository's last path segment without its tag.
///
/// `crosbymichael/redis:latest` and `redis:latest` both become `redis`.
pub fn clean_image_name(image: &str) -> String {
    let repository = remove_tag(image);
    let last = repository.rsplit('/').next().unwrap_or(repository);
    remove_slash(last)
}
