//! Argument vector construction
//!
//! Order is fixed: base tokens, `--team`, `--machine`, then caller flags in
//! insertion order. Flags whose value is `None` are dropped, so call sites
//! can pass optional overrides without branching.

/// One caller-supplied flag
#[derive(Debug, Clone, PartialEq, Eq)]
enum Flag {
    /// `--key value`, dropped when the value is `None`
    Pair(String, Option<String>),
    /// `--key` with no value
    Switch(String),
}

/// Ordered flag list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags(Vec<Flag>);

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `--key value`
    pub fn set(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.opt(key, Some(value.into()))
    }

    /// Append `--key value` only if `value` is defined
    pub fn opt<V: ToString>(mut self, key: impl Into<String>, value: Option<V>) -> Self {
        self.push(key, value.map(|v| v.to_string()));
        self
    }

    /// Append a value-less `--key` when `on`
    pub fn switch(mut self, key: impl Into<String>, on: bool) -> Self {
        if on {
            self.0.push(Flag::Switch(key.into()));
        }
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: Option<String>) {
        self.0.push(Flag::Pair(key.into(), value));
    }

    /// Number of entries, undefined ones included
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn append_to(&self, args: &mut Vec<String>) {
        for flag in &self.0 {
            match flag {
                Flag::Pair(key, Some(value)) => {
                    args.push(format!("--{}", key));
                    args.push(value.clone());
                }
                Flag::Pair(_, None) => {}
                Flag::Switch(key) => args.push(format!("--{}", key)),
            }
        }
    }
}

impl<K, V> FromIterator<(K, Option<V>)> for Flags
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        let mut flags = Flags::new();
        for (key, value) in iter {
            flags.push(key, value.map(Into::into));
        }
        flags
    }
}

/// Defaults a context contributes to every argument vector
pub trait ArgDefaults {
    fn default_team(&self) -> Option<&str>;
    fn default_machine(&self) -> Option<&str>;
}

/// No context-derived flags
pub struct NoDefaults;

impl ArgDefaults for NoDefaults {
    fn default_team(&self) -> Option<&str> {
        None
    }

    fn default_machine(&self) -> Option<&str> {
        None
    }
}

/// Keeps the team default but hides the machine, for commands whose
/// positional argument is itself the resource.
pub struct TeamOnly<'a, D: ?Sized>(pub &'a D);

impl<D: ArgDefaults + ?Sized> ArgDefaults for TeamOnly<'_, D> {
    fn default_team(&self) -> Option<&str> {
        self.0.default_team()
    }

    fn default_machine(&self) -> Option<&str> {
        None
    }
}

/// Build the argument vector for one invocation
pub fn build_args<D>(base: &[&str], defaults: &D, flags: &Flags) -> Vec<String>
where
    D: ArgDefaults + ?Sized,
{
    let mut args: Vec<String> = base.iter().map(|s| s.to_string()).collect();

    if let Some(team) = defaults.default_team() {
        args.push("--team".to_string());
        args.push(team.to_string());
    }
    if let Some(machine) = defaults.default_machine() {
        args.push("--machine".to_string());
        args.push(machine.to_string());
    }

    flags.append_to(&mut args);
    args
}

/// Build the argument vector for a destructive command.
///
/// Delete verbs do not agree on which flags they accept (some reject
/// `--force`), so they go through their own entry point.
pub fn build_delete_args<D>(base: &[&str], defaults: &D, flags: &Flags) -> Vec<String>
where
    D: ArgDefaults + ?Sized,
{
    build_args(base, defaults, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Both;

    impl ArgDefaults for Both {
        fn default_team(&self) -> Option<&str> {
            Some("Private Team")
        }

        fn default_machine(&self) -> Option<&str> {
            Some("vm1")
        }
    }

    #[test]
    fn defaults_precede_flags() {
        let flags = Flags::new().set("size", "1G");
        let args = build_args(&["repository", "create", "repo-a"], &Both, &flags);
        assert_eq!(
            args,
            vec![
                "repository", "create", "repo-a", "--team", "Private Team", "--machine", "vm1",
                "--size", "1G"
            ]
        );
    }

    #[test]
    fn undefined_values_are_dropped() {
        let flags = Flags::new()
            .opt("port", None::<u16>)
            .set("ip", "10.0.0.1")
            .opt("datastore", Some("/mnt/data"))
            .opt("renet-path", None::<String>);
        let args = build_args(&["config", "add-machine", "vm9"], &NoDefaults, &flags);
        assert_eq!(
            args,
            vec!["config", "add-machine", "vm9", "--ip", "10.0.0.1", "--datastore", "/mnt/data"]
        );
    }

    #[test]
    fn team_only_hides_machine() {
        let flags = Flags::new().switch("force", true).switch("debug", false);
        let args = build_delete_args(&["machine", "delete", "m-1"], &TeamOnly(&Both), &flags);
        assert_eq!(args, vec!["machine", "delete", "m-1", "--team", "Private Team", "--force"]);
    }

    #[test]
    fn repeated_keys_keep_insertion_order() {
        let flags: Flags = vec![
            ("param", Some("repository=r1")),
            ("param", None),
            ("param", Some("size=2G")),
        ]
        .into_iter()
        .collect();
        assert_eq!(flags.len(), 3);
        let args = build_args(&["run", "repository_resize"], &NoDefaults, &flags);
        assert_eq!(
            args,
            vec!["run", "repository_resize", "--param", "repository=r1", "--param", "size=2G"]
        );
    }

    #[test]
    fn delete_builder_matches_general_builder() {
        let flags = Flags::new().set("region", "Default Region");
        assert_eq!(
            build_delete_args(&["bridge", "delete", "b"], &Both, &flags),
            build_args(&["bridge", "delete", "b"], &Both, &flags)
        );
    }
}
