use crate::identity::RecoilElementIdentity;

pub const ERD_EXTENSION: &str = "erd";

/// Reads the seed embedded in an erd file name or path.
///
/// The input is split on `.` and the second to last part is parsed as a
/// signed integer. Fewer than three parts, or a part that does not parse,
/// yields `None`. The rest of the string is not inspected, so bare names and
/// full paths with either separator both work.
pub fn parse_seed(name: &str) -> Option<i64> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 {
        return None;
    }
    parts[parts.len() - 2].parse::<i64>().ok()
}

/// Keeps the names that are erd files of `identity`, paired with their seed.
/// Input order is preserved and duplicate seeds are passed through.
pub fn validate_erd_file_names<I, S>(names: I, identity: &RecoilElementIdentity) -> Vec<(S, i64)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefix = identity.canonical();
    names
        .into_iter()
        .filter_map(|name| {
            let seed = accept_erd_file_name(name.as_ref(), &prefix)?;
            Some((name, seed))
        })
        .collect()
}

fn accept_erd_file_name(name: &str, prefix: &str) -> Option<i64> {
    let suffix = format!(".{}", ERD_EXTENSION);
    if !name.ends_with(&suffix) || name.starts_with('.') {
        return None;
    }
    if name.contains(['/', '\\']) {
        return None;
    }
    let leading = name.split('-').next().unwrap_or_default();
    if leading != prefix {
        return None;
    }
    parse_seed(name)
}

/// Output file name the simulator writes for `seed`: `<identity>-<name>.<seed>.erd`.
pub fn erd_file_name(identity: &RecoilElementIdentity, seed: i64) -> String {
    format!(
        "{}-{}.{}.{}",
        identity.canonical(),
        identity.name(),
        seed,
        ERD_EXTENSION
    )
}
