// src/runtime/sandbox.rs
//
// Environment isolation for child processes.
//
// Scripts and verification commands never see the parent's full environment;
// only the variables below are inherited, then the caller's own entries are
// merged on top.

use std::collections::HashMap;

/// Variables copied from the parent process into every child.
pub const SAFE_ENV_VARS: &[&str] = &[
    // process basics
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    // temp dirs
    "TMPDIR",
    "TMP",
    "TEMP",
    // locale
    "LANG",
    "LANGUAGE",
    "TZ",
    // CI markers
    "CI",
    "CONTINUOUS_INTEGRATION",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    // windows essentials
    "SYSTEMROOT",
    "SYSTEMDRIVE",
    "COMSPEC",
    "PATHEXT",
    "WINDIR",
    "USERPROFILE",
    "APPDATA",
    "LOCALAPPDATA",
];

/// Prefixes inherited wholesale (`LC_ALL`, `LC_CTYPE`, ...).
pub const SAFE_ENV_PREFIXES: &[&str] = &["LC_"];

pub fn is_safe_env_var(name: &str) -> bool {
    SAFE_ENV_VARS.iter().any(|v| env_name_eq(v, name))
        || SAFE_ENV_PREFIXES.iter().any(|p| name.starts_with(p))
}

// windows env names are case-insensitive, unix ones are not
#[cfg(windows)]
fn env_name_eq(allowed: &str, name: &str) -> bool {
    allowed.eq_ignore_ascii_case(name)
}

#[cfg(not(windows))]
fn env_name_eq(allowed: &str, name: &str) -> bool {
    allowed == name
}

/// Builds the child environment from an explicit parent snapshot.
pub fn build_env_from<I>(parent: I, extra: &HashMap<String, String>) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: HashMap<String, String> = parent
        .into_iter()
        .filter(|(k, _)| is_safe_env_var(k))
        .collect();
    for (k, v) in extra {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Builds the child environment from the current process environment.
pub fn sandbox_env(extra: &HashMap<String, String>) -> HashMap<String, String> {
    build_env_from(std::env::vars(), extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_to_allowlist() {
        let parent = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("LC_ALL".to_string(), "C".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "hunter2".to_string()),
            ("OPENAI_API_KEY".to_string(), "sk-xxx".to_string()),
        ];
        let env = build_env_from(parent, &HashMap::new());
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert!(env.contains_key("LC_ALL"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!env.contains_key("OPENAI_API_KEY"));
    }

    #[cfg(unix)]
    #[test]
    fn test_lowercase_lookalikes_are_dropped() {
        let parent = vec![
            ("path".to_string(), "/tmp/evil".to_string()),
            ("Home".to_string(), "/tmp/evil".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let env = build_env_from(parent, &HashMap::new());
        assert_eq!(env.len(), 1);
        assert_eq!(env["HOME"], "/root");
    }

    #[test]
    fn test_extra_entries_override() {
        let parent = vec![("HOME".to_string(), "/root".to_string())];
        let mut extra = HashMap::new();
        extra.insert("HOME".to_string(), "/tmp/sandbox".to_string());
        extra.insert("API_TOKEN".to_string(), "granted".to_string());

        let env = build_env_from(parent, &extra);
        assert_eq!(env["HOME"], "/tmp/sandbox");
        assert_eq!(env["API_TOKEN"], "granted");
    }
}
