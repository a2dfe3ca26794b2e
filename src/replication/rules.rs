//! Repository and tag selection rules
//!
//! Patterns are literal names unless they contain `*`, which matches any run
//! of characters within one path segment, or `?`, which matches one
//! character other than `/`.

use crate::replication::job::Selection;

/// Whether `name` matches `pattern`. Without wildcards the match is exact.
pub fn match_pattern(pattern: &str, name: &str) -> bool {
    if !has_wildcard(pattern) {
        return pattern == name;
    }
    glob_match(pattern.as_bytes(), name.as_bytes())
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((b'*', rest)) => {
            // Try every split of the current segment
            let mut index = 0;
            loop {
                if glob_match(rest, &name[index..]) {
                    return true;
                }
                if index == name.len() || name[index] == b'/' {
                    return false;
                }
                index += 1;
            }
        }
        Some((b'?', rest)) => match name.split_first() {
            Some((c, tail)) if *c != b'/' => glob_match(rest, tail),
            _ => false,
        },
        Some((c, rest)) => match name.split_first() {
            Some((n, tail)) if n == c => glob_match(rest, tail),
            _ => false,
        },
    }
}

/// Destination repository for `repository` selected by `source_pattern`.
///
/// Identical patterns keep the source name. When both patterns carry one
/// `*`, the part of the source name the wildcard matched replaces the `*`
/// in the destination. Any other destination pattern is used verbatim.
pub fn destination_repository(source_pattern: &str, destination_pattern: &str, repository: &str) -> String {
    if source_pattern == destination_pattern {
        return repository.to_string();
    }

    if source_pattern.contains('*') && destination_pattern.contains('*') {
        let parts: Vec<&str> = source_pattern.split('*').collect();
        if let [prefix, suffix] = parts.as_slice() {
            if let Some(middle) = repository
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
            {
                return destination_pattern.replacen('*', middle, 1);
            }
        }
    }

    destination_pattern.to_string()
}

impl Selection {
    /// Literal repository names when no pattern needs a catalog listing
    pub fn literal_repositories(&self) -> Option<Vec<String>> {
        if self.repositories.is_empty() || self.repositories.iter().any(|r| has_wildcard(r)) {
            return None;
        }
        Some(
            self.repositories
                .iter()
                .filter(|repo| self.includes_repository(repo))
                .cloned()
                .collect(),
        )
    }

    /// Literal tags when no pattern needs a tag listing
    pub fn literal_tags(&self) -> Option<Vec<String>> {
        if self.include_tags.is_empty() || self.include_tags.iter().any(|t| has_wildcard(t)) {
            return None;
        }
        Some(
            self.include_tags
                .iter()
                .filter(|tag| self.includes_tag(tag))
                .cloned()
                .collect(),
        )
    }

    /// The first source pattern selecting `repository`, `*` for an empty
    /// selection, `None` when the repository is not selected
    pub fn matching_pattern(&self, repository: &str) -> Option<&str> {
        if self
            .exclude_repositories
            .iter()
            .any(|pattern| match_pattern(pattern, repository))
        {
            return None;
        }
        if self.repositories.is_empty() {
            return Some("*");
        }
        self.repositories
            .iter()
            .find(|pattern| match_pattern(pattern, repository))
            .map(String::as_str)
    }

    pub fn includes_repository(&self, repository: &str) -> bool {
        self.matching_pattern(repository).is_some()
    }

    pub fn includes_tag(&self, tag: &str) -> bool {
        if self.exclude_tags.iter().any(|pattern| match_pattern(pattern, tag)) {
            return false;
        }
        self.include_tags.is_empty()
            || self.include_tags.iter().any(|pattern| match_pattern(pattern, tag))
    }

    /// Where a selected repository lands at the destination
    pub fn destination_for(&self, repository: &str) -> String {
        match (&self.destination_repository, self.matching_pattern(repository)) {
            (Some(destination), Some(pattern)) => destination_repository(pattern, destination, repository),
            _ => repository.to_string(),
        }
    }
}
