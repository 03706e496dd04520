use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::Config;
use crate::models::program::OfferingType;

const BRAND: &str = "Academy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct EnrollmentConfirmation {
    pub to: Recipient,
    pub student_name: String,
    pub program_name: String,
    pub offering_type: OfferingType,
    pub total_amount: Decimal,
    pub first_payment_amount: Option<Decimal>,
    pub next_payment_due: Option<DateTime<Utc>>,
    /// Set when the payer still has to approve the payment at the processor.
    pub approval_url: Option<String>,
}

/// One enrollment a dunning job is writing about.
#[derive(Debug, Clone)]
pub struct DunningNotice {
    pub enrollment_id: Uuid,
    pub to: Recipient,
    pub student_name: String,
    pub program_name: String,
    pub amount: Decimal,
    pub due: Option<DateTime<Utc>>,
    pub auto_pay: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    First,
    Final,
}

/// Outbound transactional messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn enrollment_confirmation(&self, msg: &EnrollmentConfirmation) -> anyhow::Result<()>;
    async fn overdue_notice(&self, notice: &DunningNotice, severity: Severity) -> anyhow::Result<()>;
    async fn payment_reminder(&self, notice: &DunningNotice, severity: Severity) -> anyhow::Result<()>;
    /// Tells an owner which enrollments a final overdue run suspended.
    async fn suspension_summary(&self, owner: &Recipient, suspended: &[DunningNotice]) -> anyhow::Result<()>;
}

fn format_due(due: Option<DateTime<Utc>>) -> String {
    due.map(|d| d.format("%B %-d, %Y").to_string())
        .unwrap_or_else(|| "now".to_string())
}

fn reminder_text(notice: &DunningNotice, severity: Severity) -> (String, String) {
    let due = format_due(notice.due);
    let subject = match severity {
        Severity::First => format!("Upcoming payment for {}", notice.program_name),
        Severity::Final => format!("Action needed: payment for {} is due soon", notice.program_name),
    };
    let how = if notice.auto_pay {
        "Your saved payment method will be charged automatically; please make sure it is up to date."
    } else {
        "Please complete the payment from your parent portal before the due date."
    };
    let lead = match severity {
        Severity::First => "This is a friendly reminder",
        Severity::Final => "This is a second reminder",
    };
    let body = format!(
        "Hello {},\n\n{lead} that the monthly payment of {} for {} ({}) is due on {due}.\n{how}",
        notice.to.name, notice.amount, notice.student_name, notice.program_name
    );
    (subject, body)
}

fn overdue_text(notice: &DunningNotice, severity: Severity) -> (String, String) {
    let due = format_due(notice.due);
    match severity {
        Severity::First => (
            format!("Payment overdue for {}", notice.program_name),
            format!(
                "Hello {},\n\nWe have not received the payment of {} for {} ({}) that was due on {due}.\n\
                 Please settle it as soon as possible to keep the enrollment active.",
                notice.to.name, notice.amount, notice.student_name, notice.program_name
            ),
        ),
        Severity::Final => (
            format!("Final notice: enrollment in {} suspended", notice.program_name),
            format!(
                "Hello {},\n\nThe payment of {} for {} ({}) due on {due} is still outstanding.\n\
                 The enrollment has been suspended until the balance is paid.",
                notice.to.name, notice.amount, notice.student_name, notice.program_name
            ),
        ),
    }
}

pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailService {
    /// Returns None if SMTP is not fully configured.
    pub fn new(config: &Config) -> Option<Self> {
        let host = config.smtp_host.as_deref()?;
        let username = config.smtp_username.clone()?;
        let password = config.smtp_password.clone()?;
        let from_addr = config.smtp_from.as_deref()?;

        let port = config.smtp_port.unwrap_or(587);
        let creds = Credentials::new(username, password);

        let transport = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .ok()?
                .credentials(creds)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .ok()?
                .credentials(creds)
                .port(port)
                .build()
        };

        let from: Mailbox = from_addr.parse().ok()?;

        Some(Self { transport, from })
    }

    // ─── Private helpers ─────────────────────────────────────────────────────

    fn new_message_id(&self) -> String {
        format!("<{}@{}>", Uuid::new_v4(), self.from.email.domain())
    }

    fn mailbox(to: &Recipient) -> anyhow::Result<Mailbox> {
        format!("{} <{}>", to.name, to.email)
            .parse::<Mailbox>()
            .or_else(|_| to.email.parse::<Mailbox>())
            .with_context(|| format!("Invalid recipient address: {}", to.email))
    }

    /// Wraps inner HTML content in the shared email layout.
    fn wrap_html(title: &str, content: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width,initial-scale=1">
  <title>{title}</title>
</head>
<body style="margin:0;padding:0;background-color:#f1f5f9;font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,Helvetica,Arial,sans-serif">
  <table role="presentation" width="100%" cellpadding="0" cellspacing="0" style="background-color:#f1f5f9;padding:40px 16px">
    <tr>
      <td align="center">
        <table role="presentation" width="100%" cellpadding="0" cellspacing="0" style="max-width:520px">
          <tr>
            <td align="center" style="padding-bottom:28px">
              <p style="margin:0;font-size:20px;font-weight:700;color:#0f172a;text-align:center">{BRAND}</p>
            </td>
          </tr>
          <tr>
            <td style="background:#ffffff;border-radius:12px;padding:40px;box-shadow:0 1px 3px rgba(0,0,0,0.08),0 8px 24px rgba(0,0,0,0.04)">
              {content}
            </td>
          </tr>
        </table>
      </td>
    </tr>
  </table>
</body>
</html>"#
        )
    }

    /// Plain-text paragraphs rendered as simple HTML paragraphs.
    fn paragraphs(text: &str) -> String {
        text.split("\n\n")
            .map(|p| {
                format!(
                    r#"<p style="margin:0 0 16px 0;font-size:15px;color:#374151">{}</p>"#,
                    p.replace('\n', "<br>")
                )
            })
            .collect()
    }

    async fn send_email(&self, to: Mailbox, subject: &str, text: &str, html: &str) -> anyhow::Result<()> {
        let email = Message::builder()
            .message_id(Some(self.new_message_id()))
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.to_string()),
                    ),
            )
            .context("Failed to build email message")?;

        self.transport
            .send(email)
            .await
            .context("Failed to send email")?;

        Ok(())
    }

    async fn send_text(&self, to: &Recipient, subject: &str, text: &str) -> anyhow::Result<()> {
        let html = Self::wrap_html(subject, &Self::paragraphs(text));
        self.send_email(Self::mailbox(to)?, subject, text, &html).await
    }
}

fn confirmation_text(msg: &EnrollmentConfirmation) -> (String, String) {
    let subject = format!("Enrollment confirmed: {}", msg.program_name);
    let mut body = format!(
        "Hello {},\n\n{} is now enrolled in {}.",
        msg.to.name, msg.student_name, msg.program_name
    );
    match msg.offering_type {
        OfferingType::Sprint => {
            body.push_str(&format!("\n\nTotal paid: {}.", msg.total_amount));
        }
        OfferingType::Marathon => {
            if let Some(first) = msg.first_payment_amount {
                body.push_str(&format!("\n\nFirst (pro-rated) payment: {first}."));
            }
            body.push_str(&format!(
                "\nMonthly amount: {}, next payment on {}.",
                msg.total_amount,
                format_due(msg.next_payment_due)
            ));
        }
    }
    if let Some(url) = &msg.approval_url {
        body.push_str(&format!(
            "\n\nPlease approve the payment to complete the enrollment: {url}"
        ));
    }
    (subject, body)
}

fn summary_text(suspended: &[DunningNotice]) -> (String, String) {
    let subject = format!("{} enrollment(s) suspended for non-payment", suspended.len());
    let lines: Vec<String> = suspended
        .iter()
        .map(|n| {
            format!(
                "- {} / {} ({}), {} due {}",
                n.student_name,
                n.program_name,
                n.to.email,
                n.amount,
                format_due(n.due)
            )
        })
        .collect();
    let body = format!(
        "The final overdue check suspended the following enrollments:\n\n{}",
        lines.join("\n")
    );
    (subject, body)
}

#[async_trait]
impl Notifier for EmailService {
    async fn enrollment_confirmation(&self, msg: &EnrollmentConfirmation) -> anyhow::Result<()> {
        let (subject, text) = confirmation_text(msg);
        self.send_text(&msg.to, &subject, &text).await
    }

    async fn overdue_notice(&self, notice: &DunningNotice, severity: Severity) -> anyhow::Result<()> {
        let (subject, text) = overdue_text(notice, severity);
        self.send_text(&notice.to, &subject, &text).await
    }

    async fn payment_reminder(&self, notice: &DunningNotice, severity: Severity) -> anyhow::Result<()> {
        let (subject, text) = reminder_text(notice, severity);
        self.send_text(&notice.to, &subject, &text).await
    }

    async fn suspension_summary(&self, owner: &Recipient, suspended: &[DunningNotice]) -> anyhow::Result<()> {
        let (subject, text) = summary_text(suspended);
        self.send_text(owner, &subject, &text).await
    }
}

/// Stand-in used when SMTP is not configured: messages go to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn enrollment_confirmation(&self, msg: &EnrollmentConfirmation) -> anyhow::Result<()> {
        let (subject, _) = confirmation_text(msg);
        tracing::info!(to = %msg.to.email, "email (smtp disabled): {subject}");
        Ok(())
    }

    async fn overdue_notice(&self, notice: &DunningNotice, severity: Severity) -> anyhow::Result<()> {
        let (subject, _) = overdue_text(notice, severity);
        tracing::info!(to = %notice.to.email, "email (smtp disabled): {subject}");
        Ok(())
    }

    async fn payment_reminder(&self, notice: &DunningNotice, severity: Severity) -> anyhow::Result<()> {
        let (subject, _) = reminder_text(notice, severity);
        tracing::info!(to = %notice.to.email, "email (smtp disabled): {subject}");
        Ok(())
    }

    async fn suspension_summary(&self, owner: &Recipient, suspended: &[DunningNotice]) -> anyhow::Result<()> {
        let (subject, _) = summary_text(suspended);
        tracing::info!(to = %owner.email, "email (smtp disabled): {subject}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(auto_pay: bool) -> DunningNotice {
        DunningNotice {
            enrollment_id: Uuid::new_v4(),
            to: Recipient { email: "pat@example.com".into(), name: "Pat Doe".into() },
            student_name: "Sam Doe".into(),
            program_name: "Robotics".into(),
            amount: Decimal::new(11235, 2),
            due: None,
            auto_pay,
        }
    }

    #[test]
    fn reminder_wording_follows_auto_pay() {
        let (_, auto) = reminder_text(&notice(true), Severity::First);
        assert!(auto.contains("charged automatically"));
        let (_, manual) = reminder_text(&notice(false), Severity::First);
        assert!(manual.contains("parent portal"));
    }

    #[test]
    fn final_overdue_mentions_suspension() {
        let (subject, body) = overdue_text(&notice(true), Severity::Final);
        assert!(subject.starts_with("Final notice"));
        assert!(body.contains("suspended"));
    }

    #[test]
    fn summary_lists_every_enrollment() {
        let (subject, body) = summary_text(&[notice(true), notice(false)]);
        assert!(subject.starts_with("2 enrollment(s)"));
        assert_eq!(body.matches("Sam Doe / Robotics").count(), 2);
    }

    #[test]
    fn html_paragraphs() {
        let html = EmailService::paragraphs("a\nb\n\nc");
        assert_eq!(html.matches("<p ").count(), 2);
        assert!(html.contains("a<br>b"));
    }
}
