//! Line filters and prompt shapes.

use std::fmt;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

static ANY_HOST: Lazy<PromptShapes> = Lazy::new(|| PromptShapes {
    shell: Regex::new(r"root@[\w.-]+:.+# $").expect("literal regex"),
    bootloader: Regex::new(r"=> $").expect("literal regex"),
    login: Regex::new(r"[\w.-]+ login: $").expect("literal regex"),
    password: Regex::new(r"Password: $").expect("literal regex"),
});

/// Filter applied to decoded console lines.
///
/// `MatchAll` accepts every line. `MatchAny` accepts a line when any of its
/// patterns is found in it; an empty `MatchAny` accepts nothing. Patterns are
/// keyed by their source text, so adding the same pattern twice is a no-op.
#[derive(Clone)]
pub enum PatternSet {
    /// Accept every line.
    MatchAll,

    /// Accept lines matching at least one pattern.
    MatchAny(IndexMap<String, Regex>),
}

impl PatternSet {
    /// A set accepting nothing.
    pub fn empty() -> Self {
        PatternSet::MatchAny(IndexMap::new())
    }

    /// Compile a set from pattern strings.
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = IndexMap::new();
        for pattern in patterns {
            let regex = Regex::new(pattern.as_ref())?;
            set.insert(regex.as_str().to_string(), regex);
        }
        Ok(PatternSet::MatchAny(set))
    }

    /// Check whether a line passes the filter.
    pub fn is_match(&self, line: &str) -> bool {
        match self {
            PatternSet::MatchAll => true,
            PatternSet::MatchAny(set) => set.values().any(|regex| regex.is_match(line)),
        }
    }

    /// Check whether the filter can never match.
    pub fn is_empty(&self) -> bool {
        match self {
            PatternSet::MatchAll => false,
            PatternSet::MatchAny(set) => set.is_empty(),
        }
    }

    /// Number of patterns, `None` for `MatchAll`.
    pub fn len(&self) -> Option<usize> {
        match self {
            PatternSet::MatchAll => None,
            PatternSet::MatchAny(set) => Some(set.len()),
        }
    }

    /// Add every pattern of `other`. Anything unioned with `MatchAll` is
    /// `MatchAll`.
    pub fn union(&mut self, other: &PatternSet) {
        match (&mut *self, other) {
            (PatternSet::MatchAll, _) => {}
            (this, PatternSet::MatchAll) => *this = PatternSet::MatchAll,
            (PatternSet::MatchAny(set), PatternSet::MatchAny(more)) => {
                for (key, regex) in more {
                    set.entry(key.clone()).or_insert_with(|| regex.clone());
                }
            }
        }
    }

    /// Remove every pattern of `other`. Removing `MatchAll`, or removing
    /// anything from `MatchAll`, leaves an empty set.
    pub fn difference(&mut self, other: &PatternSet) {
        match (&mut *self, other) {
            (PatternSet::MatchAny(set), PatternSet::MatchAny(less)) => {
                set.retain(|key, _| !less.contains_key(key));
            }
            (this, _) => *this = PatternSet::empty(),
        }
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        PatternSet::MatchAll
    }
}

impl From<Regex> for PatternSet {
    fn from(regex: Regex) -> Self {
        std::iter::once(regex).collect()
    }
}

impl From<&Regex> for PatternSet {
    fn from(regex: &Regex) -> Self {
        PatternSet::from(regex.clone())
    }
}

impl FromIterator<Regex> for PatternSet {
    fn from_iter<T: IntoIterator<Item = Regex>>(iter: T) -> Self {
        PatternSet::MatchAny(
            iter.into_iter()
                .map(|regex| (regex.as_str().to_string(), regex))
                .collect(),
        )
    }
}

impl PartialEq for PatternSet {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PatternSet::MatchAll, PatternSet::MatchAll) => true,
            (PatternSet::MatchAny(a), PatternSet::MatchAny(b)) => {
                a.len() == b.len() && a.keys().all(|key| b.contains_key(key))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternSet::MatchAll => f.write_str("MatchAll"),
            PatternSet::MatchAny(set) => f.debug_set().entries(set.keys()).finish(),
        }
    }
}

/// The four interactive prompts of the console.
///
/// Prompts never end in a newline, so the line decoder uses these shapes to
/// emit a trailing fragment as a complete line. Each pattern is anchored at
/// the end of the line including the prompt's trailing space.
#[derive(Debug, Clone)]
pub struct PromptShapes {
    /// `root@<host>:<cwd># `
    pub shell: Regex,

    /// `=> `
    pub bootloader: Regex,

    /// `<host> login: `
    pub login: Regex,

    /// `Password: `
    pub password: Regex,
}

impl PromptShapes {
    /// Shapes for a board with a known hostname.
    pub fn for_host(hostname: &str) -> Result<Self, regex::Error> {
        let host = regex::escape(hostname);
        Ok(Self {
            shell: Regex::new(&format!(r"root@{host}:.+# $"))?,
            bootloader: Regex::new(r"=> $")?,
            login: Regex::new(&format!(r"{host} login: $"))?,
            password: Regex::new(r"Password: $")?,
        })
    }

    /// Shapes accepting any hostname.
    pub fn any_host() -> Self {
        ANY_HOST.clone()
    }

    /// Check whether a line ends in any interactive prompt.
    pub fn is_prompt(&self, line: &str) -> bool {
        self.shell.is_match(line)
            || self.bootloader.is_match(line)
            || self.login.is_match(line)
            || self.password.is_match(line)
    }

    /// Prompt patterns as a filter, for waits on any of them.
    pub fn all(&self) -> PatternSet {
        [
            self.shell.clone(),
            self.bootloader.clone(),
            self.login.clone(),
            self.password.clone(),
        ]
        .into_iter()
        .collect()
    }
}

impl Default for PromptShapes {
    fn default() -> Self {
        Self::any_host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> PatternSet {
        PatternSet::new(patterns).unwrap()
    }

    #[test]
    fn test_match_all_and_empty() {
        assert!(PatternSet::MatchAll.is_match("anything"));
        assert!(!PatternSet::empty().is_match("anything"));
        assert!(PatternSet::empty().is_empty());
        assert!(!PatternSet::MatchAll.is_empty());
    }

    #[test]
    fn test_match_any() {
        let filter = set(&[r"eth0: link becomes ready", r"wlan0: link becomes ready"]);
        assert!(filter.is_match("[   12.3] eth0: link becomes ready"));
        assert!(!filter.is_match("[   12.3] usb0: link becomes ready"));
    }

    #[test]
    fn test_union_deduplicates() {
        let mut filter = set(&["a", "b"]);
        filter.union(&set(&["b", "c"]));
        assert_eq!(filter.len(), Some(3));
        assert_eq!(filter, set(&["a", "b", "c"]));

        filter.union(&PatternSet::MatchAll);
        assert_eq!(filter, PatternSet::MatchAll);
    }

    #[test]
    fn test_difference_narrows() {
        let mut filter = set(&["a", "b"]);
        filter.difference(&set(&["a", "z"]));
        assert_eq!(filter, set(&["b"]));

        filter.difference(&set(&["b"]));
        assert!(filter.is_empty());

        let mut all = PatternSet::MatchAll;
        all.difference(&set(&["a"]));
        assert!(all.is_empty());
    }

    #[test]
    fn test_prompt_shapes_for_host() {
        let shapes = PromptShapes::for_host("board-ui43").unwrap();
        assert!(shapes.shell.is_match("root@board-ui43:~# "));
        assert!(shapes.login.is_match("board-ui43 login: "));
        assert!(shapes.bootloader.is_match("=> "));
        assert!(shapes.password.is_match("Password: "));

        assert!(!shapes.shell.is_match("root@board-ui43:~# ls"));
        assert!(!shapes.login.is_match("other login: "));
        assert!(!shapes.is_prompt("Starting kernel ..."));
    }

    #[test]
    fn test_any_host_shapes() {
        let shapes = PromptShapes::any_host();
        assert!(shapes.is_prompt("root@host:/tmp# "));
        assert!(shapes.is_prompt("imx6 login: "));
        assert!(shapes.all().is_match("=> "));
    }
}
