//! Console commands for running a review cycle

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use sqlx::{PgConnection, PgPool};
use std::error::Error;
use std::path::PathBuf;
use uuid::Uuid;

use crate::batch;
use crate::db;
use crate::db::periods::Cycle;
use crate::db::staff::NewStaffUser;
use crate::export::{ExportData, ExportGrouping};
use crate::handlers::hash_password;
use crate::models::{ReviewRound, ReviewerRole, StaffUser};
use crate::validation::{normalize_email, validate_email, validate_name, validate_username};
use crate::workflow::forms::FormConfig;
use crate::workflow::stages::end_of_day;

pub type CommandResult = Result<(), Box<dyn Error>>;

/// Staff performance reviews: web service and cycle administration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server (default)
    Serve,

    #[command(flatten)]
    Task(Task),
}

/// One-off administration of the review data
#[derive(Subcommand, Debug)]
pub enum Task {
    /// Create a staff user
    CreateUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        password: String,
        /// Username of the line manager
        #[arg(long)]
        line_manager: Option<String>,
        #[arg(long)]
        admin: bool,
    },

    /// Create a review period; an existing one is left as is
    CreatePeriod {
        #[arg(long)]
        year: i32,
        /// FULL_YEAR (FY) or MID_YEAR (MY)
        #[arg(long)]
        round: ReviewRound,
    },

    /// Add the stages a period is missing, one week apart from next Monday
    AddDefaultStages {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        round: ReviewRound,
    },

    /// Create or replace forms from a YAML file naming its period
    ImportForms { file: PathBuf },

    /// Every staff member reviews their line manager
    NominateLineManagers,

    /// Every staff member assesses themselves
    SelfNominate {
        /// Staff ids to leave out, one per line
        #[arg(long)]
        exclude_file: Option<PathBuf>,
    },

    /// Set the deadline of all of a reviewer's nominations; clear it when
    /// no date is given
    ExtendReviewer {
        username: String,
        date: Option<NaiveDate>,
    },

    /// Set the deadline of all nominations with a role
    ExtendRole {
        role: ReviewerRole,
        date: NaiveDate,
        /// Only this reviewer's nominations (email address)
        #[arg(long)]
        user: Option<String>,
    },

    /// Line managers assess the reports that reviewed them
    NominateAssessment {
        /// List the missing assessments
        #[arg(long)]
        report: bool,
        /// Create the missing assessments
        #[arg(long)]
        create: bool,
    },

    /// CSV of reviewees with invitations that were never sent
    ExternalInvitesNotSent,

    /// Write the completed reviews to a zip file
    ExportReviews {
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = ExportGrouping::Reviewee)]
        per: ExportGrouping,
        /// Only this reviewee's reviews (username or id)
        #[arg(long)]
        user: Option<String>,
    },
}

impl Task {
    pub async fn run(self, pool: &PgPool, now: DateTime<Utc>, tz: Tz) -> CommandResult {
        let mut tx = pool.begin().await?;

        match self {
            Task::CreateUser {
                username,
                email,
                first_name,
                last_name,
                password,
                line_manager,
                admin,
            } => {
                validate_username(&username)?;
                let email = normalize_email(&email);
                validate_email(&email)?;
                validate_name("first_name", &first_name)?;
                validate_name("last_name", &last_name)?;

                let line_manager_id = match line_manager {
                    Some(name) => Some(
                        db::staff::find_by_username(&mut tx, &name)
                            .await?
                            .ok_or_else(|| format!("Line manager {} not found", name))?
                            .id,
                    ),
                    None => None,
                };
                let password_hash = hash_password(&password)
                    .map_err(|e| format!("Failed to hash password: {}", e))?;

                let user = db::staff::create_staff_user(
                    &mut tx,
                    &NewStaffUser {
                        username: &username,
                        email: &email,
                        first_name: first_name.trim(),
                        last_name: last_name.trim(),
                        password_hash: &password_hash,
                        line_manager_id,
                        is_admin: admin,
                    },
                )
                .await?;
                println!("Created {} ({})", user.full_name(), user.id);
            }

            Task::CreatePeriod { year, round } => {
                let (period, created) =
                    db::periods::get_or_create_period(&mut tx, year, round).await?;
                if created {
                    println!("Created {}", period.name());
                } else {
                    println!("{} already exists", period.name());
                }
            }

            Task::AddDefaultStages { year, round } => {
                let period = db::periods::find_period(&mut tx, year, round)
                    .await?
                    .ok_or_else(|| format!("No {} {} period", year, round.label()))?;
                let planned = db::periods::add_default_stages(&mut tx, period.id, now, tz).await?;
                for stage in planned {
                    println!(
                        "{:<20} {}{}",
                        stage.code.label(),
                        stage.date.with_timezone(&tz).format("%a %d %b %Y %H:%M"),
                        if stage.created { "" } else { " (existing)" }
                    );
                }
            }

            Task::ImportForms { file } => {
                let config = FormConfig::load(&file)?;
                let (Some(year), Some(round)) = (config.year, config.period) else {
                    return Err("The forms file must name its year and period".into());
                };
                let period = db::periods::find_period(&mut tx, year, round)
                    .await?
                    .ok_or_else(|| format!("No {} {} period", year, round.label()))?;
                let summary = db::forms::create_review_forms(&mut tx, period.id, &config).await?;
                println!(
                    "{}: {} forms, {} questions",
                    period.name(),
                    summary.forms,
                    summary.questions
                );
            }

            Task::NominateLineManagers => {
                let Some(cycle) = current_cycle(&mut tx, now).await? else {
                    return Ok(());
                };
                let summary = batch::nominate_line_managers(&mut tx, cycle.period.id, now).await?;
                println!("{} nominations saved, {} skipped", summary.saved, summary.skipped);
            }

            Task::SelfNominate { exclude_file } => {
                let Some(cycle) = current_cycle(&mut tx, now).await? else {
                    return Ok(());
                };
                let exclude = match exclude_file {
                    Some(path) => {
                        batch::parse_exclude_list(&tokio::fs::read_to_string(path).await?)
                    }
                    None => Default::default(),
                };
                let summary = batch::self_nominate(&mut tx, cycle.period.id, now, &exclude).await?;
                println!("{} self-assessments saved, {} excluded", summary.saved, summary.skipped);
            }

            Task::ExtendReviewer { username, date } => {
                let Some(cycle) = current_cycle(&mut tx, now).await? else {
                    return Ok(());
                };
                let reviewer = db::staff::find_by_username(&mut tx, &username)
                    .await?
                    .ok_or_else(|| format!("User {} not found", username))?;
                let deadline = date.map(|d| end_of_day(d, tz));
                let updated = db::nominations::extend_reviewer(
                    &mut tx,
                    cycle.period.id,
                    reviewer.id,
                    deadline,
                )
                .await?;
                match deadline {
                    Some(d) => {
                        println!("{} nominations now close {}", updated, d.with_timezone(&tz))
                    }
                    None => println!("{} nominations reset to the period deadline", updated),
                }
            }

            Task::ExtendRole { role, date, user } => {
                let Some(cycle) = current_cycle(&mut tx, now).await? else {
                    return Ok(());
                };
                let reviewer_id = match user {
                    Some(email) => Some(
                        db::staff::find_by_email(&mut tx, &normalize_email(&email))
                            .await?
                            .ok_or_else(|| format!("User {} not found", email))?
                            .id,
                    ),
                    None => None,
                };
                let deadline = end_of_day(date, tz);
                let updated = db::nominations::extend_role(
                    &mut tx,
                    cycle.period.id,
                    role,
                    reviewer_id,
                    deadline,
                )
                .await?;
                println!(
                    "{} {} nominations now close {}",
                    updated,
                    role.label(),
                    deadline.with_timezone(&tz)
                );
            }

            Task::NominateAssessment { report, create } => {
                let Some(cycle) = current_cycle(&mut tx, now).await? else {
                    return Ok(());
                };
                let plan = batch::nominate_assessments(&mut tx, &cycle, create).await?;
                if report || !create {
                    for gap in &plan.missing {
                        println!("Missing: {} assesses {}", gap.reviewer, gap.reviewee);
                    }
                }
                for outdated in &plan.outdated {
                    println!(
                        "{}: {} assesses {}",
                        if create { "Updated" } else { "Outdated deadline" },
                        outdated.gap.reviewer,
                        outdated.gap.reviewee
                    );
                }
                for gap in &plan.conflicts {
                    println!(
                        "Skipped: {} already reviews {} in another role",
                        gap.reviewer, gap.reviewee
                    );
                }
                println!(
                    "{} missing, {} with an outdated deadline{}",
                    plan.missing.len(),
                    plan.outdated.len(),
                    if create { ", saved" } else { "" }
                );
            }

            Task::ExternalInvitesNotSent => {
                let Some(cycle) = current_cycle(&mut tx, now).await? else {
                    return Ok(());
                };
                let invitations =
                    db::external::invitation_summaries(&mut tx, cycle.period.id, None).await?;
                print!("{}", batch::unsent_invites_csv(&invitations));
            }

            Task::ExportReviews { out, per, user } => {
                let Some(cycle) = current_cycle(&mut tx, now).await? else {
                    return Ok(());
                };
                let mut data = ExportData::load(&mut tx, cycle.period).await?;
                if let Some(user) = user {
                    let reviewee = find_user(&mut tx, &user)
                        .await?
                        .ok_or_else(|| format!("User {} not found", user))?;
                    data.retain_reviewee(reviewee.id);
                }
                let (bytes, summary) = data.archive(per, tz)?;
                tokio::fs::write(&out, bytes).await?;
                println!(
                    "Wrote {} documents ({} nominations, {} without responses, {} failed) to {}",
                    summary.documents,
                    summary.nominations,
                    summary.empty,
                    summary.failed,
                    out.display()
                );
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

/// The current cycle, or `None` after telling the operator there is none
async fn current_cycle(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<Option<Cycle>, sqlx::Error> {
    let cycle = db::periods::current_cycle(conn, now).await?;
    if cycle.is_none() {
        println!("No current review cycle found");
    }
    Ok(cycle)
}

/// A staff user by username, or by id when the argument parses as one
async fn find_user(
    conn: &mut PgConnection,
    user: &str,
) -> Result<Option<StaffUser>, sqlx::Error> {
    match user.parse::<Uuid>() {
        Ok(id) => db::staff::find_by_id(conn, id).await,
        Err(_) => db::staff::find_by_username(conn, user).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Task {
        let mut argv = vec!["staff-reviews"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command.unwrap() {
            Command::Task(task) => task,
            Command::Serve => panic!("parsed as serve"),
        }
    }

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["staff-reviews"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from(["staff-reviews", "serve"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Serve)));
    }

    #[test]
    fn test_parse_round_alias() {
        match parse(&["create-period", "--year", "2024", "--round", "MY"]) {
            Task::CreatePeriod { year, round } => {
                assert_eq!(year, 2024);
                assert_eq!(round, ReviewRound::MidYear);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_extend_role() {
        match parse(&["extend-role", "DR", "2024-07-12", "--user", "ann@example.org"]) {
            Task::ExtendRole { role, date, user } => {
                assert_eq!(role, ReviewerRole::DirectReport);
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 7, 12).unwrap());
                assert_eq!(user.as_deref(), Some("ann@example.org"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_extend_reviewer_without_date() {
        match parse(&["extend-reviewer", "ann"]) {
            Task::ExtendReviewer { username, date } => {
                assert_eq!(username, "ann");
                assert!(date.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_export_grouping() {
        match parse(&["export-reviews", "out.zip"]) {
            Task::ExportReviews { per, .. } => assert_eq!(per, ExportGrouping::Reviewee),
            other => panic!("unexpected {:?}", other),
        }
        match parse(&["export-reviews", "out.zip", "--per", "nomination"]) {
            Task::ExportReviews { per, .. } => assert_eq!(per, ExportGrouping::Nomination),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_export_single_reviewee() {
        match parse(&["export-reviews", "sam.zip", "--user", "sjones"]) {
            Task::ExportReviews { user, per, .. } => {
                assert_eq!(user.as_deref(), Some("sjones"));
                assert_eq!(per, ExportGrouping::Reviewee);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let args = ["staff-reviews", "extend-role", "BOSS", "2024-07-12"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
