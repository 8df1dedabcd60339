//! Notifier (NT): RFC-2822 emails on VM quarantine events and per-patch
//! status changes (spec.md §2.9, §4.2, §6 "Notification format").
//!
//! Message composition is pure and unit-testable; delivery goes through
//! the [`Smtp`] trait so tests can substitute a recording fake instead of
//! opening a real connection. `LettreSmtp` is the production
//! implementation; `lettre` is the natural idiomatic SMTP client for this
//! ecosystem.

use crate::config::SmtpConfig;
use crate::error::{Error, Result};

/// One outgoing notification, shaped directly after the headers spec.md
/// §6 mandates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub x_patch_status: Option<String>,
    pub x_patch_url: Option<String>,
    pub reply_to: Option<String>,
    pub body: String,
}

/// Delivery abstraction. Implemented by `LettreSmtp` in production and by
/// a recording fake in tests.
pub trait Smtp: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<()>;
}

/// A `Smtp` that does nothing, for installations that have not
/// configured an SMTP relay. Notifications are logged, not silently
/// dropped.
pub struct NullSmtp;

impl Smtp for NullSmtp {
    fn send(&self, notification: &Notification) -> Result<()> {
        log::warn!(
            "no SMTP relay configured; dropping notification to {}: {}",
            notification.to,
            notification.subject
        );
        Ok(())
    }
}

/// Compose the operator email sent when a VM enters `offline` (spec.md
/// §4.2 "Entering `offline` triggers NT to email the operator").
pub fn vm_offline_notification(smtp: &SmtpConfig, vm: &str, cause: &str) -> Result<Notification> {
    let from = operator_from(smtp)?;
    let to = operator_to(smtp)?;
    Ok(Notification {
        from,
        to,
        subject: format!("[winci] VM `{vm}` marked offline"),
        in_reply_to: None,
        references: None,
        x_patch_status: None,
        x_patch_url: None,
        reply_to: None,
        body: format!("VM `{vm}` was taken offline by the scheduler.\n\nCause: {cause}\n"),
    })
}

/// Compose the operator email sent when a VLW(monitor) finds a
/// previously `offline` VM reachable again (spec.md §4.2 "Leaving
/// `offline` on its own ... triggers a 'recovered' email").
pub fn vm_recovered_notification(smtp: &SmtpConfig, vm: &str) -> Result<Notification> {
    let from = operator_from(smtp)?;
    let to = operator_to(smtp)?;
    Ok(Notification {
        from,
        to,
        subject: format!("[winci] VM `{vm}` recovered"),
        in_reply_to: None,
        references: None,
        x_patch_status: None,
        x_patch_url: None,
        reply_to: None,
        body: format!("VM `{vm}` responded to a health check and has returned to service.\n"),
    })
}

/// Compose the author email sent on a per-patch Job status change. Author
/// address and message-id threading are supplied by the patch-ingestion
/// pipeline (out of scope, spec.md §1); this core only shapes the
/// message once those are known.
pub fn patch_status_notification(
    smtp: &SmtpConfig,
    author_address: &str,
    msgid: &str,
    status: &str,
    job_url: &str,
) -> Result<Notification> {
    let from = operator_from(smtp)?;
    Ok(Notification {
        from,
        to: author_address.to_string(),
        subject: format!("Test results for your patch ({status})"),
        in_reply_to: Some(msgid.to_string()),
        references: Some(msgid.to_string()),
        x_patch_status: Some(status.to_string()),
        x_patch_url: Some(job_url.to_string()),
        reply_to: smtp.operator_address.clone(),
        body: format!("Your patch finished testing with status: {status}\n\nDetails: {job_url}\n"),
    })
}

fn operator_from(smtp: &SmtpConfig) -> Result<String> {
    smtp.from_address.clone().ok_or_else(|| Error::NotifyFailed {
        to: "operator".to_string(),
        message: "smtp.from_address is not configured".to_string(),
    })
}

fn operator_to(smtp: &SmtpConfig) -> Result<String> {
    smtp.operator_address.clone().ok_or_else(|| Error::NotifyFailed {
        to: "operator".to_string(),
        message: "smtp.operator_address is not configured".to_string(),
    })
}

pub mod lettre_smtp {
    use lettre::message::Message as MailMessage;
    use lettre::transport::smtp::SmtpTransport;
    use lettre::Transport;

    use super::{Notification, Smtp};
    use crate::config::SmtpConfig;
    use crate::error::{Error, Result};

    /// Production `Smtp` backed by `lettre`'s blocking SMTP transport.
    pub struct LettreSmtp {
        transport: SmtpTransport,
    }

    impl LettreSmtp {
        pub fn new(config: &SmtpConfig) -> Result<Self> {
            let host = config.host.as_deref().ok_or_else(|| Error::NotifyFailed {
                to: "smtp".to_string(),
                message: "smtp.host is not configured".to_string(),
            })?;
            let transport = SmtpTransport::builder_dangerous(host)
                .port(config.port)
                .build();
            Ok(LettreSmtp { transport })
        }
    }

    impl Smtp for LettreSmtp {
        fn send(&self, notification: &Notification) -> Result<()> {
            let mut builder = MailMessage::builder()
                .from(notification.from.parse().map_err(|err| parse_err(notification, err))?)
                .to(notification.to.parse().map_err(|err| parse_err(notification, err))?)
                .subject(&notification.subject);
            if let Some(in_reply_to) = &notification.in_reply_to {
                builder = builder.header(lettre::message::header::InReplyTo::from(in_reply_to.clone()));
            }
            if let Some(references) = &notification.references {
                builder = builder.header(lettre::message::header::References::from(references.clone()));
            }
            if let Some(reply_to) = &notification.reply_to {
                builder = builder.reply_to(reply_to.parse().map_err(|err| parse_err(notification, err))?);
            }
            let message = builder
                .body(notification.body.clone())
                .map_err(|err| Error::NotifyFailed {
                    to: notification.to.clone(),
                    message: format!("failed to build message: {err}"),
                })?;
            self.transport.send(&message).map_err(|err| Error::NotifyFailed {
                to: notification.to.clone(),
                message: err.to_string(),
            })?;
            Ok(())
        }
    }

    fn parse_err(notification: &Notification, err: impl std::fmt::Display) -> Error {
        Error::NotifyFailed {
            to: notification.to.clone(),
            message: format!("invalid address: {err}"),
        }
    }
}
