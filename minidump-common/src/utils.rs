/// The final component of a path, accepting both `/` and `\` separators.
///
/// Module paths in a dump come from the machine that wrote it, so the host's
/// `std::path` rules do not apply.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
