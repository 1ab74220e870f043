//! Git metadata captured at build time.

pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    /// `"true"` or `"false"` as emitted by vergen.
    pub git_dirty: Option<&'static str>,
}

/// Missing when the crate is built outside a git checkout.
pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    git_dirty: option_env!("VERGEN_GIT_DIRTY"),
};
