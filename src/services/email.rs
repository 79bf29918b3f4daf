use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{error, info, warn};

use crate::config;
use crate::error::DeterrentError;
use crate::messages::Detection;
use crate::utils::detection_utils::capitalize;

/// Common providers, printed when the email self-test fails: name, server, port, note.
pub const SMTP_PRESETS: &[(&str, &str, u16, &str)] = &[
    ("Gmail", "smtp.gmail.com", 587, "Requires App Password with 2FA enabled"),
    ("Yahoo", "smtp.mail.yahoo.com", 587, "Requires App Password"),
    ("Outlook/Hotmail", "smtp-mail.outlook.com", 587, "Use your regular password"),
    ("Office 365", "smtp.office365.com", 587, "Use your regular password"),
];

/// SMTP notification sender.
///
/// Authentication always uses the configured service account. The visible sender can be
/// overridden per run; replies then go to the override address as well.
#[derive(Clone, Debug)]
pub struct EmailService {
    settings: config::Email,
    location: String,
    sender_override: Option<String>,
}

impl EmailService {
    pub fn new(settings: config::Email, location: impl Into<String>) -> Self {
        Self {
            settings,
            location: location.into(),
            sender_override: None,
        }
    }

    pub fn with_sender_override(mut self, sender: Option<String>) -> Self {
        self.sender_override = sender.filter(|sender| !sender.trim().is_empty());
        self
    }

    pub fn with_recipient_override(mut self, recipient: Option<String>) -> Self {
        if let Some(recipient) = recipient.filter(|recipient| !recipient.trim().is_empty()) {
            self.settings.recipient_email = recipient;
        }
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.settings.sender_email.is_empty() && !self.settings.sender_password.is_empty()
    }

    pub fn recipient(&self) -> &str {
        &self.settings.recipient_email
    }

    /// Required `[email]` settings that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let settings = &self.settings;
        [
            ("smtp_server", settings.smtp_server.trim().is_empty()),
            ("smtp_port", settings.smtp_port == 0),
            ("sender_email", settings.sender_email.trim().is_empty()),
            ("sender_password", settings.sender_password.is_empty()),
            ("recipient_email", settings.recipient_email.trim().is_empty()),
        ]
        .into_iter()
        .filter_map(|(field, missing)| missing.then_some(field))
        .collect()
    }

    /// The password as asterisks, for display.
    pub fn masked_password(&self) -> String {
        "*".repeat(self.settings.sender_password.chars().count())
    }

    /// Checks that email is enabled and every required setting is present.
    pub fn check_settings(&self) -> Result<(), DeterrentError> {
        if !self.settings.enabled {
            return Err(DeterrentError::Config(
                "email alerts are disabled, set [email].enabled = true".to_string(),
            ));
        }
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(DeterrentError::Config(format!(
                "missing required email settings: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Builds the alert message. `attachment` is the JPEG bytes and file name of the snapshot.
    pub fn compose(
        &self,
        detection: &Detection,
        attachment: Option<(String, Vec<u8>)>,
    ) -> Result<Message, DeterrentError> {
        let from_address = self
            .sender_override
            .as_deref()
            .unwrap_or(&self.settings.sender_email);
        let from: Mailbox = from_address.parse()?;
        let to: Mailbox = self.settings.recipient_email.parse()?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(format!("ALERT: {} Detected!", detection.label.to_uppercase()));
        if let Some(reply_to) = &self.sender_override {
            builder = builder.reply_to(reply_to.parse()?);
        }

        let body = SinglePart::html(render_body(detection, &self.location));
        let multipart = match attachment {
            Some((file_name, bytes)) => {
                let content_type = ContentType::parse("image/jpeg")
                    .map_err(|err| DeterrentError::Other(err.to_string()))?;
                MultiPart::mixed()
                    .singlepart(body)
                    .singlepart(Attachment::new(file_name).body(bytes, content_type))
            }
            None => MultiPart::mixed().singlepart(body),
        };

        Ok(builder.multipart(multipart)?)
    }

    /// Sends one alert. The snapshot is attached when the file can be read.
    pub async fn send_alert(
        &self,
        detection: &Detection,
        image_path: Option<&Path>,
    ) -> Result<(), DeterrentError> {
        if !self.is_configured() {
            warn!("Email not configured. Skipping email alert.");
            return Ok(());
        }

        let attachment = match image_path {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let file_name = path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                        .unwrap_or_else(|| "detection.jpg".to_string());
                    Some((file_name, bytes))
                }
                Err(err) => {
                    warn!("Could not attach image {}: {}", path.display(), err);
                    None
                }
            },
            None => None,
        };

        let message = self.compose(detection, attachment)?;

        match self.mailer()?.send(message).await {
            Ok(_) => {
                info!("Email alert sent successfully for {}", detection.label);
                Ok(())
            }
            Err(err) => {
                if err.is_permanent() {
                    error!(
                        "Email rejected by {} (check credentials): {}",
                        self.settings.smtp_server, err
                    );
                } else {
                    error!("Failed to send email via {}: {}", self.settings.smtp_server, err);
                }
                Err(err.into())
            }
        }
    }

    /// Builds the configuration test message sent by `send_test`.
    pub fn compose_test(&self, sent_at: DateTime<Local>) -> Result<Message, DeterrentError> {
        let from: Mailbox = self.settings.sender_email.parse()?;
        let to: Mailbox = self.settings.recipient_email.parse()?;
        Ok(Message::builder()
            .from(from)
            .to(to)
            .subject("Test Email - Animal Detection System")
            .singlepart(SinglePart::html(render_test_body(&self.settings, sent_at)))?)
    }

    /// Validates the settings, then logs in over STARTTLS and sends a test message.
    pub async fn send_test(&self) -> Result<(), DeterrentError> {
        self.check_settings()?;
        let message = self.compose_test(Local::now())?;

        info!(
            "Connecting to {}:{} as {}",
            self.settings.smtp_server, self.settings.smtp_port, self.settings.sender_email
        );
        let mailer = self.mailer()?;
        if !mailer.test_connection().await? {
            return Err(DeterrentError::Other(format!(
                "{} did not accept the connection",
                self.settings.smtp_server
            )));
        }
        mailer.send(message).await?;
        info!("Test email sent to {}", self.settings.recipient_email);
        Ok(())
    }

    fn mailer(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeterrentError> {
        Ok(
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.settings.smtp_server)?
                .port(self.settings.smtp_port)
                .credentials(Credentials::new(
                    self.settings.sender_email.clone(),
                    self.settings.sender_password.clone(),
                ))
                .timeout(Some(Duration::from_secs(self.settings.timeout_secs)))
                .build(),
        )
    }
}

fn render_body(detection: &Detection, location: &str) -> String {
    let detected_at: DateTime<Local> = detection.frame_timestamp.with_timezone(&Local);
    format!(
        r#"<html>
<body style="font-family: Arial, sans-serif; margin: 20px;">
  <div style="background-color: #f8d7da; border: 2px solid #d9534f; padding: 20px; border-radius: 5px;">
    <h2 style="color: #d9534f; margin-top: 0;">Animal Detection Alert</h2>
    <table style="width: 100%; margin-top: 15px;">
      <tr><td style="padding: 8px;"><strong>Animal Type:</strong></td><td style="padding: 8px;">{animal}</td></tr>
      <tr><td style="padding: 8px;"><strong>Confidence:</strong></td><td style="padding: 8px;">{confidence:.2}%</td></tr>
      <tr><td style="padding: 8px;"><strong>Detection Time:</strong></td><td style="padding: 8px;">{time}</td></tr>
      <tr><td style="padding: 8px;"><strong>Location:</strong></td><td style="padding: 8px;">{location}</td></tr>
    </table>
  </div>
  <div style="margin-top: 20px; padding: 15px; background-color: #f5f5f5; border-radius: 5px;">
    <p style="margin: 0; color: #666; font-size: 14px;">
      <strong>Action Required:</strong> Please check your farm perimeter.
      Sound alert has been activated to deter the animal.
    </p>
  </div>
  <hr style="margin-top: 20px; border: none; border-top: 1px solid #ddd;">
  <p style="color: #999; font-size: 12px; margin-top: 20px;">
    This is an automated alert from your Animal Repellent Detection System.
  </p>
</body>
</html>"#,
        animal = capitalize(&detection.label),
        confidence = detection.confidence * 100.0,
        time = detected_at.format("%Y-%m-%d %H:%M:%S"),
        location = location,
    )
}

fn render_test_body(settings: &config::Email, sent_at: DateTime<Local>) -> String {
    format!(
        r#"<html>
<body style="font-family: Arial, sans-serif; padding: 20px;">
  <div style="background-color: #d1ecf1; border: 2px solid #0c5460; padding: 20px; border-radius: 5px;">
    <h2 style="color: #0c5460;">Email Configuration Test Successful!</h2>
    <p>Your Animal Detection System is configured correctly and ready to send alerts.</p>
    <hr>
    <ul>
      <li><strong>Test Time:</strong> {time}</li>
      <li><strong>SMTP Server:</strong> {server}</li>
      <li><strong>Sender:</strong> {sender}</li>
      <li><strong>Recipient:</strong> {recipient}</li>
    </ul>
  </div>
</body>
</html>"#,
        time = sent_at.format("%Y-%m-%d %H:%M:%S"),
        server = settings.smtp_server,
        sender = settings.sender_email,
        recipient = settings.recipient_email,
    )
}
