//! Line grammars for the sshd auth log
//!
//! Only two line shapes matter: an accepted publickey login and a closed
//! session. Everything else in the log is ignored without comment.

use regex::Regex;

/// A matched login-accepted line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoginLine {
    pub pid: String,
    pub username: String,
    pub addr: String,
    pub port: String,
    pub fingerprint: String,
}

/// A matched session-closed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogoutLine {
    pub pid: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AuthLine {
    Login(LoginLine),
    Logout(LogoutLine),
}

pub(crate) struct LineParser {
    login: Regex,
    logout: Regex,
}

impl LineParser {
    pub(crate) fn new() -> Self {
        // Fixed patterns; construction cannot fail.
        Self {
            login: Regex::new(
                r"sshd\[(?P<pid>\d+)\]: Accepted publickey for (?P<username>\w+) from (?P<ip>\d+\.\d+\.\d+\.\d+) port (?P<port>\d+) ssh2: (?P<fingerprint>.+)",
            )
            .expect("login pattern"),
            logout: Regex::new(
                r"sshd\[(?P<pid>\d+)\]:.*session closed for user (?P<username>\w+)",
            )
            .expect("logout pattern"),
        }
    }

    /// Match one log line. The fingerprint is opaque and captured
    /// verbatim to the end of the line.
    pub(crate) fn parse(&self, line: &str) -> Option<AuthLine> {
        if let Some(caps) = self.login.captures(line) {
            return Some(AuthLine::Login(LoginLine {
                pid: caps["pid"].to_string(),
                username: caps["username"].to_string(),
                addr: caps["ip"].to_string(),
                port: caps["port"].to_string(),
                fingerprint: caps["fingerprint"].to_string(),
            }));
        }
        if let Some(caps) = self.logout.captures(line) {
            return Some(AuthLine::Logout(LogoutLine {
                pid: caps["pid"].to_string(),
                username: caps["username"].to_string(),
            }));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_publickey_login() {
        let parser = LineParser::new();
        let line = "Jan 10 03:14:11 bastion sshd[8751]: Accepted publickey for terry \
                    from 172.20.0.147 port 53710 ssh2: RSA SHA256:Ovco...";
        let parsed = parser.parse(line).expect("login line");
        assert_eq!(
            parsed,
            AuthLine::Login(LoginLine {
                pid: "8751".to_string(),
                username: "terry".to_string(),
                addr: "172.20.0.147".to_string(),
                port: "53710".to_string(),
                fingerprint: "RSA SHA256:Ovco...".to_string(),
            })
        );
    }

    #[test]
    fn test_fingerprint_is_captured_verbatim() {
        let parser = LineParser::new();
        let line = "sshd[12]: Accepted publickey for alice from 10.0.0.1 port 2222 \
                    ssh2: ED25519 SHA256:abc+def/ghi=";
        match parser.parse(line) {
            Some(AuthLine::Login(login)) => {
                assert_eq!(login.fingerprint, "ED25519 SHA256:abc+def/ghi=");
            }
            other => panic!("expected login, got {:?}", other),
        }
    }

    #[test]
    fn test_matches_session_closed_with_pam_prefix() {
        let parser = LineParser::new();
        let line = "Jan 10 10:45:12 bastion sshd[8751]: pam_unix(sshd:session): \
                    session closed for user terry";
        assert_eq!(
            parser.parse(line),
            Some(AuthLine::Logout(LogoutLine {
                pid: "8751".to_string(),
                username: "terry".to_string(),
            }))
        );
    }

    #[test]
    fn test_matches_bare_session_closed() {
        let parser = LineParser::new();
        let line = "sshd[100]: session closed for user root";
        assert_eq!(
            parser.parse(line),
            Some(AuthLine::Logout(LogoutLine {
                pid: "100".to_string(),
                username: "root".to_string(),
            }))
        );
    }

    #[test]
    fn test_ignores_unrelated_lines() {
        let parser = LineParser::new();
        let lines = [
            "Jan 10 03:14:09 bastion sshd[8751]: Failed password for invalid user admin from 1.2.3.4 port 9999 ssh2",
            "Jan 10 03:15:01 bastion CRON[9000]: pam_unix(cron:session): session opened for user root",
            "Jan 10 03:14:10 bastion sshd[8751]: Accepted password for terry from 172.20.0.147 port 53710 ssh2",
            "",
        ];
        for line in lines {
            assert_eq!(parser.parse(line), None, "should not match: {}", line);
        }
    }
}
