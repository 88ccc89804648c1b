use anyhow::anyhow;
use handlebars::{handlebars_helper, Handlebars};
use lazy_static::lazy_static;
use lettre::{ClientSecurity, SmtpClient, SmtpTransport, Transport};
use lettre_email::EmailBuilder;
use log::{debug, trace};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::notifications::Notify;
use crate::{RunRecord, StageResult};


lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"([a-zA-Z_\- 0-9]+ )?<?([a-z0-9_\-\.\+]+@[a-z0-9\.\-_]+)>?").unwrap();
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SmtpConfig {
    pub(crate) addr: String,
    pub(crate) port: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Mailer {
    pub(crate) from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) recipients: Option<Vec<String>>,
    pub(crate) server: SmtpConfig,
}

fn status_label(record: &RunRecord) -> &'static str {
    match record.succeeded() {
        true => "Success",
        false => "Failure",
    }
}

fn subject(record: &RunRecord) -> String {
    format!(
        "bake-ci #{} on {}: {}",
        record.number,
        record.branch.as_deref().unwrap_or("?"),
        status_label(record)
    )
}

fn stage_json(s: &StageResult) -> Value {
    let duration = match (s.start_date, s.end_date) {
        (Some(start), Some(end)) => Some((end - start).num_seconds()),
        _ => None,
    };
    json!({
        "name": s.name,
        "outcome": s.outcome,
        "timed": duration.is_some(),
        "duration": duration,
        "logs": s.logs,
    })
}

fn render_text(record: &RunRecord) -> anyhow::Result<(String, String)> {
    let mut reg = Handlebars::new();
    handlebars_helper!(seconds: |s: i64| format!("{}s", s));
    reg.register_helper("seconds", Box::new(seconds));
    let ctx = json!({
        "number": record.number,
        "branch": record.branch.as_deref().unwrap_or("?"),
        "status": status_label(record),
        "commit": record.commit,
        "image_tag": record.image_tag,
        "failed_stage": record.failed_stage,
        "stages": record.stages.iter().map(stage_json).collect::<Vec<Value>>(),
    });
    trace!("mail context: {:#}", ctx);
    Ok((
        reg.render_template(
            include_str!("../../../resources/templates/notifs/mail.txt.hbs"),
            &ctx,
        )?,
        reg.render_template(
            include_str!("../../../resources/templates/notifs/mail.html.hbs"),
            &ctx,
        )?,
    ))
}

enum EmailAddress {
    Single(String),
    Complete(String, String),
}

fn to_addr(s: &str) -> anyhow::Result<EmailAddress> {
    let matches = EMAIL_REGEX
        .captures(s)
        .ok_or_else(|| anyhow!("could not make sense of \"{}\" as an email addr", s))?;
    match (matches.get(1), matches.get(2)) {
        (Some(name), Some(email)) => Ok(EmailAddress::Complete(
            email.as_str().to_string(),
            name.as_str().to_string(),
        )),
        (None, Some(email)) => Ok(EmailAddress::Single(email.as_str().to_string())),
        _ => Err(anyhow!("could not make sense of \"{}\" as an email addr", s)),
    }
}

impl Notify for Mailer {
    fn send(&self, record: &RunRecord) -> anyhow::Result<()> {
        let mut email = match to_addr(&self.from)? {
            EmailAddress::Single(s) => {
                trace!("mail from {}", s);
                EmailBuilder::new().from(s)
            }
            EmailAddress::Complete(e, n) => {
                trace!("mail from {:?}", (&e, &n));
                EmailBuilder::new().from((e, n))
            }
        };
        let mut has_recipient = false;
        if let Some(commit) = &record.commit {
            email = email.to((commit.author.email.clone(), commit.author.name.clone()));
            has_recipient = true;
        }
        for recipient in self.recipients.iter().flatten() {
            debug!("Adding {} to recipients", recipient);
            email = match to_addr(recipient)? {
                EmailAddress::Single(s) => email.to(s),
                EmailAddress::Complete(e, n) => email.to((e, n)),
            };
            has_recipient = true;
        }
        if !has_recipient {
            return Err(anyhow!("no one to send the run results to"));
        }
        if let Some(reply_to) = &self.reply_to {
            email = email.reply_to(reply_to.as_str());
        }
        let (txt, html) = render_text(record)?;
        let email = email
            .subject(subject(record))
            .alternative(html, txt)
            .build()
            .map_err(|e| anyhow!("could not build mail: {}", e))?;
        let mut mailer = SmtpTransport::new(SmtpClient::new(
            format!("{}:{}", self.server.addr, self.server.port),
            ClientSecurity::None,
        )?);
        mailer.send(email.into())?;
        Ok(())
    }
}
