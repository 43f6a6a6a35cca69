use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use herald_queue::EmailStatus;

/// Herald - scheduled email delivery
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(version)]
#[command(about = "Durable scheduled email queue and SMTP dispatcher", long_about = None)]
pub struct Cli {
    /// Configuration file (default: $HERALD_CONFIG or ~/.herald/herald.toml)
    #[arg(long = "config", global = true)]
    pub config: Option<String>,

    /// Override the SQLite database path
    #[arg(long = "db", global = true)]
    pub db: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the dispatcher until Ctrl-C, then drain in-flight sends
    Run,

    /// Run one dispatch cycle: send everything due now, wait for it, exit
    SendDue,

    /// Queue an email
    Schedule {
        #[arg(long = "user")]
        user: String,

        #[arg(long = "org")]
        org: String,

        /// Recipient address (repeatable)
        #[arg(long = "to", required = true)]
        to: Vec<String>,

        #[arg(long = "subject")]
        subject: String,

        /// Plain-text body
        #[arg(long = "body")]
        body: String,

        /// Optional HTML body sent as an alternative part
        #[arg(long = "html")]
        html: Option<String>,

        /// Send time as RFC 3339 (default: now)
        #[arg(long = "at", value_name = "RFC3339")]
        at: Option<DateTime<Utc>>,

        /// Retry budget for transient failures (default: retry.default_max_retries)
        #[arg(long = "max-retries")]
        max_retries: Option<u32>,
    },

    /// Show one email
    Status { id: String },

    /// Cancel a pending email
    Cancel { id: String },

    /// Queue counts by status
    Stats {
        /// Restrict to one organization
        #[arg(long = "org")]
        org: Option<String>,
    },

    /// List emails, oldest schedule first
    List {
        #[arg(long = "status")]
        status: Option<EmailStatus>,

        #[arg(long = "user")]
        user: Option<String>,

        #[arg(long = "org")]
        org: Option<String>,

        #[arg(long = "limit", default_value_t = 50)]
        limit: usize,
    },

    /// Requeue or fail emails stuck in processing
    Reconcile {
        /// Age after which a processing email counts as stuck (default: dispatcher.stale_after_secs)
        #[arg(long = "grace-secs")]
        grace_secs: Option<u64>,
    },

    /// Manage reusable email templates
    Template {
        #[command(subcommand)]
        action: TemplateCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommand {
    /// Store a new template
    Add {
        #[arg(long = "user")]
        user: String,

        #[arg(long = "org")]
        org: String,

        /// Unique per user
        #[arg(long = "name")]
        name: String,

        #[arg(long = "subject")]
        subject: String,

        #[arg(long = "body")]
        body: String,

        #[arg(long = "html")]
        html: Option<String>,

        /// Placeholder the template expects (repeatable)
        #[arg(long = "var")]
        var: Vec<String>,
    },

    /// Show one template
    Get { id: String },

    /// List a user's templates by name
    List {
        #[arg(long = "user")]
        user: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_schedule_with_repeated_recipients() {
        let cli = Cli::try_parse_from([
            "herald",
            "schedule",
            "--user",
            "u-1",
            "--org",
            "acme",
            "--to",
            "a@example.com",
            "--to",
            "b@example.com",
            "--subject",
            "Hi",
            "--body",
            "Hello",
            "--at",
            "2030-01-01T09:00:00Z",
        ])
        .unwrap();

        match cli.command {
            Command::Schedule { to, at, max_retries, .. } => {
                assert_eq!(to.len(), 2);
                assert_eq!(at.unwrap().to_rfc3339(), "2030-01-01T09:00:00+00:00");
                assert_eq!(max_retries, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn send_due_takes_no_arguments() {
        let cli = Cli::try_parse_from(["herald", "--db", "/tmp/h.db", "send-due"]).unwrap();
        assert!(matches!(cli.command, Command::SendDue));
        assert_eq!(cli.db.as_deref(), Some("/tmp/h.db"));
        assert!(Cli::try_parse_from(["herald", "send-due", "extra"]).is_err());
    }

    #[test]
    fn parses_template_add_with_variables() {
        let cli = Cli::try_parse_from([
            "herald",
            "template",
            "add",
            "--user",
            "u-1",
            "--org",
            "acme",
            "--name",
            "welcome",
            "--subject",
            "Welcome {{first_name}}",
            "--body",
            "Hi {{first_name}}",
            "--var",
            "first_name",
            "--var",
            "plan",
        ])
        .unwrap();

        match cli.command {
            Command::Template {
                action: TemplateCommand::Add { name, var, html, .. },
            } => {
                assert_eq!(name, "welcome");
                assert_eq!(var, vec!["first_name", "plan"]);
                assert_eq!(html, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn template_list_requires_user() {
        assert!(Cli::try_parse_from(["herald", "template", "list"]).is_err());
        let cli = Cli::try_parse_from(["herald", "template", "list", "--user", "u-1"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Template {
                action: TemplateCommand::List { .. }
            }
        ));
    }

    #[test]
    fn list_accepts_status_filter() {
        let cli = Cli::try_parse_from(["herald", "list", "--status", "failed", "--limit", "5"])
            .unwrap();
        match cli.command {
            Command::List { status, limit, .. } => {
                assert_eq!(status, Some(EmailStatus::Failed));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
