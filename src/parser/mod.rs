//! Stateless log line classification.
//!
//! Raw line + source → `Option<Event>`. Lines that match no known
//! pattern produce `None`, never an error. Timestamp extraction
//! failures fall back to the caller-supplied "now" — a ban record
//! with an approximate time beats no record at all.

use std::net::IpAddr;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::models::{Event, EventKind};

/// Parser with pre-compiled patterns. Construct once, share freely.
pub struct EventParser {
    /// Jail attributed to sshd auth-log events.
    auth_jail: String,
    ssh_fail_re: Regex,
    ssh_ok_re: Regex,
    from_re: Regex,
    rhost_re: Regex,
    f2b_jail_re: Regex,
    f2b_ban_re: Regex,
    f2b_unban_re: Regex,
    f2b_found_re: Regex,
    f2b_ts_re: Regex,
    syslog_ts_re: Regex,
}

impl EventParser {
    pub fn new(auth_jail: &str) -> Self {
        EventParser {
            auth_jail: auth_jail.to_string(),
            ssh_fail_re: Regex::new(r"\b(Failed password|Invalid user|authentication failure)\b")
                .unwrap(),
            ssh_ok_re: Regex::new(r"\bAccepted (password|publickey)\b").unwrap(),
            from_re: Regex::new(r"\bfrom\s+(\S+)").unwrap(),
            rhost_re: Regex::new(r"\brhost=(\S+)").unwrap(),
            // Jail names start with a letter, which keeps the PID
            // bracket (e.g. "[1234]:") from matching.
            f2b_jail_re: Regex::new(r"\[([A-Za-z][A-Za-z0-9_.:-]*)\]").unwrap(),
            f2b_ban_re: Regex::new(r"\bBan\s+(\S+)").unwrap(),
            f2b_unban_re: Regex::new(r"\bUnban\s+(\S+)").unwrap(),
            f2b_found_re: Regex::new(r"\bFound\s+(\S+)").unwrap(),
            f2b_ts_re: Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}),\d+").unwrap(),
            syslog_ts_re: Regex::new(r"^([A-Z][a-z]{2})\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})")
                .unwrap(),
        }
    }

    /// Classify an sshd auth-log line (FAIL / OK).
    pub fn parse_auth_line(&self, line: &str, now: i64) -> Option<Event> {
        let kind = if self.ssh_fail_re.is_match(line) {
            EventKind::Fail
        } else if self.ssh_ok_re.is_match(line) {
            EventKind::Ok
        } else {
            return None;
        };

        let ip = self.extract_auth_ip(line)?;
        let timestamp = self.syslog_timestamp(line, now).unwrap_or(now);
        Some(Event {
            ip,
            jail: self.auth_jail.clone(),
            kind,
            timestamp,
            raw_line: line.to_string(),
        })
    }

    /// Classify a fail2ban-log line (BAN / UNBAN / FAIL).
    ///
    /// `Found <ip>` lines are fail2ban's per-failure matches and are
    /// counted as FAIL.
    pub fn parse_fail2ban_line(&self, line: &str, now: i64) -> Option<Event> {
        let (kind, candidate) = if let Some(c) = self.f2b_ban_re.captures(line) {
            (EventKind::Ban, c.get(1)?.as_str())
        } else if let Some(c) = self.f2b_unban_re.captures(line) {
            (EventKind::Unban, c.get(1)?.as_str())
        } else if let Some(c) = self.f2b_found_re.captures(line) {
            (EventKind::Fail, c.get(1)?.as_str())
        } else {
            return None;
        };

        let ip = parse_ip_token(candidate)?;
        let jail = self
            .f2b_jail_re
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let timestamp = self.fail2ban_timestamp(line).unwrap_or(now);
        Some(Event {
            ip,
            jail,
            kind,
            timestamp,
            raw_line: line.to_string(),
        })
    }

    fn extract_auth_ip(&self, line: &str) -> Option<IpAddr> {
        if let Some(c) = self.from_re.captures(line) {
            if let Some(ip) = parse_ip_token(c.get(1)?.as_str()) {
                return Some(ip);
            }
        }
        if let Some(c) = self.rhost_re.captures(line) {
            if let Some(ip) = parse_ip_token(c.get(1)?.as_str()) {
                return Some(ip);
            }
        }
        // Last resort: any whitespace token that parses as an address.
        line.split_whitespace().find_map(parse_ip_token)
    }

    /// `2026-01-29 12:34:56,789 ...` → epoch seconds (UTC).
    fn fail2ban_timestamp(&self, line: &str) -> Option<i64> {
        let c = self.f2b_ts_re.captures(line)?;
        let dt = NaiveDateTime::parse_from_str(c.get(1)?.as_str(), "%Y-%m-%d %H:%M:%S").ok()?;
        Some(Utc.from_utc_datetime(&dt).timestamp())
    }

    /// `Jan 29 12:34:56 ...` → epoch seconds. Syslog omits the year;
    /// assume the current one, stepping back a year when that lands
    /// in the future (December logs read in January).
    fn syslog_timestamp(&self, line: &str, now: i64) -> Option<i64> {
        let c = self.syslog_ts_re.captures(line)?;
        let month = match c.get(1)?.as_str() {
            "Jan" => 1,
            "Feb" => 2,
            "Mar" => 3,
            "Apr" => 4,
            "May" => 5,
            "Jun" => 6,
            "Jul" => 7,
            "Aug" => 8,
            "Sep" => 9,
            "Oct" => 10,
            "Nov" => 11,
            "Dec" => 12,
            _ => return None,
        };
        let day: u32 = c.get(2)?.as_str().parse().ok()?;
        let time = c.get(3)?.as_str();
        let year = Utc
            .timestamp_opt(now, 0)
            .single()
            .map(|d| d.year())
            .unwrap_or(1970);

        for candidate_year in [year, year - 1] {
            let date = NaiveDate::from_ymd_opt(candidate_year, month, day)?;
            let dt = NaiveDateTime::parse_from_str(
                &format!("{} {}", date.format("%Y-%m-%d"), time),
                "%Y-%m-%d %H:%M:%S",
            )
            .ok()?;
            let ts = Utc.from_utc_datetime(&dt).timestamp();
            // Allow a day of clock skew before assuming last year.
            if ts <= now + 86_400 {
                return Some(ts);
            }
        }
        None
    }
}

/// Parse a token as an IP literal, shedding the punctuation log
/// formats wrap addresses in. Handles IPv4 and IPv6.
fn parse_ip_token(token: &str) -> Option<IpAddr> {
    let trimmed = token.trim_matches(|c: char| !c.is_ascii_hexdigit() && c != '.' && c != ':');
    if trimmed.is_empty() {
        return None;
    }
    IpAddr::from_str(trimmed).ok()
}
