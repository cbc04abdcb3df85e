// src/services/email.rs

use crate::{
    config::{Config, SmtpConfig},
    errors::AppError,
    models::subscription::{Invoice, Order, Transaction},
};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<(), AppError>;
}

/// Sends through the mailer and logs failures; mail never fails a billing step.
pub async fn send_quietly(mailer: &dyn Mailer, mail: Option<OutgoingMail>) {
    let Some(mail) = mail else {
        return;
    };
    let to = mail.to.clone();
    if let Err(e) = mailer.send(mail).await {
        error!("Failed to send mail to {}: {}", to, e);
    }
}

// ─── SMTP ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SmtpMailer {
    smtp: SmtpConfig,
    from: String,
}

impl SmtpMailer {
    pub fn new(smtp: SmtpConfig, config: &Config) -> Self {
        Self {
            smtp,
            from: format!("{} <{}>", config.email_from_name, config.email_from_address),
        }
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, AppError> {
        let creds = Credentials::new(self.smtp.username.clone(), self.smtp.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp.host)
            .map_err(|e| AppError::EmailError(e.to_string()))?
            .credentials(creds)
            .port(self.smtp.port)
            .build();

        Ok(transport)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), AppError> {
        let from_mailbox = self
            .from
            .parse()
            .map_err(|e: lettre::address::AddressError| AppError::EmailError(e.to_string()))?;

        let to_mailbox = mail
            .to
            .parse()
            .map_err(|e: lettre::address::AddressError| AppError::EmailError(e.to_string()))?;

        let email = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(mail.subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(mail.text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(mail.html),
                    ),
            )
            .map_err(|e| AppError::EmailError(e.to_string()))?;

        let transport = self.build_transport()?;

        match transport.send(email).await {
            Ok(_) => {
                info!("Email sent to {}", mail.to);
                Ok(())
            }
            Err(e) => Err(AppError::EmailError(e.to_string())),
        }
    }
}

/// Used when SMTP is not configured.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), AppError> {
        info!("Mail to {} not sent (no SMTP configured): {}", mail.to, mail.subject);
        Ok(())
    }
}

pub fn mailer_from_config(config: &Config) -> Arc<dyn Mailer> {
    match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp.clone(), config)),
        None => Arc::new(LogMailer),
    }
}

// ─── Templates ────────────────────────────────────────────────────────────────

fn format_amount(amount: Decimal, currency: &str) -> String {
    format!("{} {:.2}", currency, amount)
}

pub fn invoice_mail(order: &Order, invoice: &Invoice) -> Option<OutgoingMail> {
    let to = order.partner_email.clone()?;
    let total = format_amount(invoice.amount_total, &invoice.currency);

    let rows: String = invoice
        .lines
        .iter()
        .map(|l| format!("<tr><td>{}</td><td>{}</td></tr>", l.name, format_amount(l.subtotal, &invoice.currency)))
        .collect();
    let text_rows: String = invoice
        .lines
        .iter()
        .map(|l| format!("  {:<48} {}\n", l.name, format_amount(l.subtotal, &invoice.currency)))
        .collect();

    Some(OutgoingMail {
        to,
        subject: format!("Invoice {} for {}", invoice.name, order.name),
        text: format!(
            "Invoice {} for subscription {}\n\n{}\nTotal: {}\n",
            invoice.name, order.name, text_rows, total
        ),
        html: format!(
            r#"<!DOCTYPE html>
<html lang="en">
<body style="font-family: Arial, sans-serif; color: #333;">
  <h2>Invoice {}</h2>
  <p>Subscription {}</p>
  <table>{}</table>
  <p><strong>Total: {}</strong></p>
</body>
</html>"#,
            invoice.name, order.name, rows, total
        ),
    })
}

pub fn payment_confirmation_mail(order: &Order, tx: &Transaction) -> Option<OutgoingMail> {
    let to = order.partner_email.clone()?;
    let amount = format_amount(tx.amount, &tx.currency);
    Some(OutgoingMail {
        to,
        subject: format!("Payment received for {}", order.name),
        text: format!("We received your payment of {} (ref {}).\n", amount, tx.reference),
        html: format!(
            "<p>We received your payment of <strong>{}</strong> (ref {}).</p>",
            amount, tx.reference
        ),
    })
}
