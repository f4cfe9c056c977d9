use std::fs;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use log::{info, warn};
use regex::Regex;

use crate::config::AutoResponderConfig;
use crate::email::{mailbox_or_placeholder, EmailAddress, Envelope, MailError, MessageHeaders};
use crate::filter::full_match;
use crate::store::MessageSink;

/// Port on which SMTP servers expect TLS from the first byte.
const SMTPS_PORT: u16 = 465;

/// Answers every delivered message with a fixed reply over SMTP instead of
/// storing it.
pub struct AutoResponderSink {
    config: AutoResponderConfig,
    ignore_from: Option<Regex>,
    template: Option<String>,
    mailer: Option<SmtpTransport>,
}

impl AutoResponderSink {
    pub fn new(config: AutoResponderConfig) -> Result<Self, MailError> {
        let ignore_from = config
            .ignore_from
            .as_deref()
            .map(full_match)
            .transpose()
            .map_err(|e| MailError::Parse(e.to_string()))?;

        Ok(Self {
            config,
            ignore_from,
            template: None,
            mailer: None,
        })
    }

    fn load_template(&mut self) -> Result<&str, MailError> {
        if self.template.is_none() {
            let text = fs::read_to_string(&self.config.template)?;
            self.template = Some(text);
        }
        Ok(self.template.as_deref().unwrap_or_default())
    }

    fn build_mailer(&self) -> Result<SmtpTransport, MailError> {
        let host = &self.config.smtp_host;
        let tls_params = TlsParameters::new(host.clone()).map_err(|e| MailError::Smtp(e.to_string()))?;
        let tls = if self.config.smtp_port == SMTPS_PORT {
            Tls::Wrapper(tls_params)
        } else {
            Tls::Required(tls_params)
        };

        let mut builder = SmtpTransport::relay(host)
            .map_err(|e| MailError::Smtp(e.to_string()))?
            .port(self.config.smtp_port)
            .tls(tls);
        if !self.config.smtp_user.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.smtp_user.clone(),
                self.config.smtp_password.clone(),
            ));
        }
        Ok(builder.build())
    }

    fn ignores(&self, sender: &EmailAddress) -> bool {
        self.ignore_from
            .as_ref()
            .map_or(false, |pattern| sender.match_forms().iter().any(|form| pattern.is_match(form)))
    }

    /// Builds the reply to a message, or `None` when it should not be
    /// answered.
    fn build_reply(&mut self, headers: &MessageHeaders) -> Result<Option<Message>, MailError> {
        let recipient = match (&self.config.to, headers.sender()) {
            (_, Some(sender)) if self.ignores(sender) => {
                info!("Not answering \"{}\" from {}", headers.subject, sender.address);
                return Ok(None);
            }
            (Some(to), _) => mailbox_or_placeholder(to)?,
            (None, Some(sender)) => Mailbox::new(
                sender.name.clone(),
                sender
                    .address
                    .parse()
                    .map_err(|e: lettre::address::AddressError| MailError::Parse(e.to_string()))?,
            ),
            (None, None) => {
                warn!("\"{}\" has no sender to answer", headers.subject);
                return Ok(None);
            }
        };

        let subject = if headers.subject.is_empty() {
            self.config.default_subject.clone()
        } else {
            format!("Re: {}", headers.subject)
        };

        let mut builder = Message::builder()
            .from(mailbox_or_placeholder(&self.config.from)?)
            .to(recipient)
            .subject(subject);
        if let Some(bcc) = &self.config.bcc {
            builder = builder.bcc(mailbox_or_placeholder(bcc)?);
        }
        if let Some(id) = &headers.message_id {
            builder = builder.in_reply_to(format!("<{}>", id));
        }

        let body = self.load_template()?.to_string();
        Ok(Some(builder.header(ContentType::TEXT_PLAIN).body(body)?))
    }
}

impl MessageSink for AutoResponderSink {
    fn default_folder(&self) -> &str {
        "INBOX"
    }

    fn connect(&mut self) -> Result<(), MailError> {
        self.load_template()?;
        self.mailer = Some(self.build_mailer()?);
        info!("Answering messages through {}:{}", self.config.smtp_host, self.config.smtp_port);
        Ok(())
    }

    fn deliver(&mut self, _folder: &str, _message: &Envelope, headers: &MessageHeaders) -> Result<(), MailError> {
        let Some(reply) = self.build_reply(headers)? else {
            return Ok(());
        };
        if self.mailer.is_none() {
            self.mailer = Some(self.build_mailer()?);
        }
        let mailer = self.mailer.as_ref().ok_or(MailError::Disconnected)?;

        mailer.send(&reply).map_err(|e| MailError::Smtp(e.to_string()))?;
        info!("Answered \"{}\"", headers.subject);
        Ok(())
    }
}
