use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        short_sha(BUILD_INFO.commit_sha1),
        dirty_suffix(BUILD_INFO.git_dirty)
    )
});

fn short_sha(sha: Option<&str>) -> &str {
    match sha {
        Some(sha) if sha.len() > 8 => &sha[..8],
        Some(sha) => sha,
        None => "unknown",
    }
}

fn dirty_suffix(git_dirty: Option<&str>) -> &'static str {
    if git_dirty == Some("true") {
        "-dirty"
    } else {
        ""
    }
}
