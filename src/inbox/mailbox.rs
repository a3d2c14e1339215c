use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use serde::Deserialize;
use std::path::Path;

use crate::error::{ConfigError, DlTdvmsError, MailError};

/// A message as read from the mailbox
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    /// `Message-ID` header, or `uid:<n>` when the header is missing
    pub id: String,
    pub uid: u32,
    pub from: String,
    pub subject: String,
    /// Decoded text of every text part
    pub body: String,
    pub received_at: Option<DateTime<Utc>>,
}

/// Read-only access to notification mails. Implementations must not change
/// flags or delete anything.
pub trait Mailbox: Send {
    /// All messages currently in the inbox from `sender`, oldest first
    fn fetch(&mut self, sender: &str) -> Result<Vec<MailMessage>, MailError>;
}

/// IMAP login read from a YAML credentials file
#[derive(Clone, Deserialize)]
pub struct ImapCredentials {
    pub imap_url: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
}

fn default_imap_port() -> u16 {
    993
}

// Custom Debug implementation to hide sensitive data
impl std::fmt::Debug for ImapCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapCredentials")
            .field("imap_url", &self.imap_url)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .finish()
    }
}

impl ImapCredentials {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DlTdvmsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()).into());
        }
        let content = std::fs::read_to_string(path)?;
        let creds: ImapCredentials = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError(format!("Failed to parse IMAP credentials: {}", e))
        })?;
        if creds.imap_url.trim().is_empty() || creds.username.is_empty() {
            return Err(ConfigError::Invalid {
                field: "imap_url".to_string(),
                reason: "IMAP server and username are required".to_string(),
            }
            .into());
        }
        Ok(creds)
    }
}

/// Mailbox on an IMAP server over TLS. A fresh session is opened for every
/// fetch so long waits between polls never hold an idle connection.
pub struct ImapMailbox {
    credentials: ImapCredentials,
}

impl ImapMailbox {
    pub fn new(credentials: ImapCredentials) -> Self {
        Self { credentials }
    }
}

impl Mailbox for ImapMailbox {
    fn fetch(&mut self, sender: &str) -> Result<Vec<MailMessage>, MailError> {
        let host = self.credentials.imap_url.as_str();
        let tls = native_tls::TlsConnector::builder().build()?;
        let client = imap::connect((host, self.credentials.port), host, &tls)?;
        let mut session = client
            .login(&self.credentials.username, &self.credentials.password)
            .map_err(|(e, _)| e)?;

        // BODY.PEEK keeps \Seen untouched
        session.select("INBOX")?;
        let query = format!("FROM \"{}\"", sender.replace('"', ""));
        let mut uids: Vec<u32> = session.uid_search(&query)?.into_iter().collect();
        uids.sort_unstable();

        let mut messages = Vec::with_capacity(uids.len());
        if !uids.is_empty() {
            let set = uids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let fetches = session.uid_fetch(&set, "(UID BODY.PEEK[])")?;
            for fetch in fetches.iter() {
                let uid = fetch.uid.unwrap_or(fetch.message);
                let Some(raw) = fetch.body() else {
                    tracing::warn!(uid, "Message without body, skipping");
                    continue;
                };
                match parse_message(uid, raw) {
                    Ok(message) => messages.push(message),
                    Err(e) => tracing::warn!("{}", e),
                }
            }
        }

        session.logout()?;
        messages.sort_by_key(|m| m.uid);
        tracing::debug!(count = messages.len(), sender, "Fetched notification mails");
        Ok(messages)
    }
}

/// Parse a raw RFC 822 message
pub(crate) fn parse_message(uid: u32, raw: &[u8]) -> Result<MailMessage, MailError> {
    let parsed = mailparse::parse_mail(raw).map_err(|e| MailError::Parse {
        id: format!("uid:{}", uid),
        reason: e.to_string(),
    })?;

    let headers = &parsed.headers;
    let id = headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("uid:{}", uid));
    let received_at = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

    let mut body = String::new();
    collect_text(&parsed, &mut body);

    Ok(MailMessage {
        id,
        uid,
        from: headers.get_first_value("From").unwrap_or_default(),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        body,
        received_at,
    })
}

fn collect_text(part: &ParsedMail<'_>, out: &mut String) {
    if part.subparts.is_empty() {
        if part.ctype.mimetype.starts_with("text/") {
            if let Ok(text) = part.get_body() {
                out.push_str(&text);
                out.push('\n');
            }
        }
        return;
    }
    for sub in &part.subparts {
        collect_text(sub, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_message() {
        let raw = b"Message-ID: <abc@afad.gov.tr>\r\n\
From: tdvms@afad.gov.tr\r\n\
Subject: Veri talebi\r\n\
Date: Mon, 6 Feb 2023 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
https://tdvms.afad.gov.tr/files/req_123.zip\r\n";
        let msg = parse_message(7, raw).unwrap();
        assert_eq!(msg.id, "<abc@afad.gov.tr>");
        assert_eq!(msg.uid, 7);
        assert_eq!(msg.subject, "Veri talebi");
        assert!(msg.body.contains("files/req_123.zip"));
        assert_eq!(msg.received_at.unwrap().timestamp(), 1675677600);
    }

    #[test]
    fn test_parse_multipart_quoted_printable() {
        let raw = b"From: tdvms@afad.gov.tr\r\n\
Content-Type: multipart/alternative; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
<a href=3D\"https://tdvms.afad.gov.tr/files/abc_1.zip\">link</a>\r\n\
--XX--\r\n";
        let msg = parse_message(3, raw).unwrap();
        assert_eq!(msg.id, "uid:3");
        assert!(msg.body.contains("href=\"https://tdvms.afad.gov.tr/files/abc_1.zip\""));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds: ImapCredentials =
            serde_yaml::from_str("imap_url: imap.example.org\nusername: me\npassword: hunter2\n")
                .unwrap();
        assert_eq!(creds.port, 993);
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.yml");
        std::fs::write(&path, "imap_url: imap.example.org\nport: 1993\nusername: me\npassword: pw\n").unwrap();
        let creds = ImapCredentials::load(&path).unwrap();
        assert_eq!(creds.port, 1993);
        assert!(ImapCredentials::load(dir.path().join("missing.yml")).is_err());
    }
}
