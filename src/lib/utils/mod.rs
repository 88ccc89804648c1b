use std::borrow::Cow;

use crate::Env;

pub mod docker;
pub mod git;
pub mod redact;
pub mod retry;
pub mod runner;
pub mod ssh;


/// Trims newlines (\r & \n) from the given string
/// ```rust
/// use bakeci::utils::trim_newline;
/// let mut s = "abc1234\n".to_string();
/// trim_newline(&mut s);
/// assert_eq!(s, "abc1234");
/// ```
pub fn trim_newline(s: &mut String) {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
}

/// Quotes `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Expands `$VAR` and `${VAR}` from `env`. Unknown variables are left untouched.
pub fn interpolate<'a>(s: &'a str, env: &Env) -> Cow<'a, str> {
    shellexpand::env_with_context_no_errors(s, |k| env.get(k))
}

/// Hosts for which "remote" commands are run locally
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}
