//! Allow-list filtering of the server environment for child processes.
//!
//! Build processes never inherit the server environment wholesale. At startup the
//! allow-listed variables are captured once into an [`EnvironmentSpec`], which is
//! then shared read-only by every build.

/// The ordered set of variables passed from the server into build processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSpec {
    vars: Vec<(String, String)>,
}

impl EnvironmentSpec {
    /// Filters `snapshot` down to the names in `allow_list`.
    ///
    /// Output follows allow-list order. Names missing from the snapshot are
    /// skipped silently, and a name listed twice is only emitted once.
    pub fn from_snapshot<I, K, V>(snapshot: I, allow_list: &[String]) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let snapshot: std::collections::HashMap<String, String> = snapshot
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut vars: Vec<(String, String)> = Vec::with_capacity(allow_list.len());
        for name in allow_list {
            if vars.iter().any(|(k, _)| k == name) {
                continue;
            }
            if let Some(value) = snapshot.get(name) {
                vars.push((name.clone(), value.clone()));
            }
        }

        Self { vars }
    }

    /// Reads the current process environment once and filters it.
    ///
    /// Variables whose name or value is not valid UTF-8 are ignored.
    pub fn capture(allow_list: &[String]) -> Self {
        let snapshot = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        Self::from_snapshot(snapshot, allow_list)
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Names only, for logging without leaking values.
    pub fn names(&self) -> Vec<&str> {
        self.vars.iter().map(|(k, _)| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn allow(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filters_to_allow_list_in_order() {
        let snapshot = vec![
            ("SECRET_TOKEN", "hunter2"),
            ("PATH", "/usr/bin"),
            ("HOME", "/home/play"),
        ];
        let spec = EnvironmentSpec::from_snapshot(snapshot, &allow(&["HOME", "PATH"]));

        assert_eq!(
            spec.vars(),
            &[
                ("HOME".to_string(), "/home/play".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ]
        );
        assert!(spec.get("SECRET_TOKEN").is_none());
    }

    #[test]
    fn test_missing_names_are_omitted() {
        let spec = EnvironmentSpec::from_snapshot(
            vec![("PATH", "/bin")],
            &allow(&["GOROOT", "PATH", "GOCACHE"]),
        );
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.get("PATH"), Some("/bin"));
    }

    #[test]
    fn test_duplicate_allow_entries_emit_once() {
        let spec =
            EnvironmentSpec::from_snapshot(vec![("PATH", "/bin")], &allow(&["PATH", "PATH"]));
        assert_eq!(spec.names(), vec!["PATH"]);
    }

    #[test]
    fn test_empty_allow_list_yields_empty_spec() {
        let spec = EnvironmentSpec::from_snapshot(vec![("PATH", "/bin")], &[]);
        assert!(spec.is_empty());
    }

    #[test]
    #[serial]
    fn test_capture_reads_process_environment() {
        std::env::set_var("SANDPIT_ENV_TEST_ALLOWED", "yes");
        std::env::set_var("SANDPIT_ENV_TEST_DENIED", "no");

        let spec = EnvironmentSpec::capture(&allow(&["SANDPIT_ENV_TEST_ALLOWED"]));
        assert_eq!(spec.get("SANDPIT_ENV_TEST_ALLOWED"), Some("yes"));
        assert!(spec.get("SANDPIT_ENV_TEST_DENIED").is_none());

        std::env::remove_var("SANDPIT_ENV_TEST_ALLOWED");
        std::env::remove_var("SANDPIT_ENV_TEST_DENIED");
    }
}
