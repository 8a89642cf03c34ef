use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod attempts;
mod catalog;
mod config;
mod dashboard;
mod db;
mod directory;
mod error;
mod import;
mod matcher;
mod models;
mod reconcile;
mod report;
mod scoring;
mod service;
mod status;
mod store;

use config::Settings;
use dashboard::{Dashboard, Freshness};
use error::ProgressError;
use models::{CohortYear, Role, Student, StudentPatch, Submission};
use service::{ImportOutcome, ProgressService};
use store::{MemoryStore, ProgressStore};

#[derive(Parser)]
#[command(name = "progress-tracker")]
#[command(about = "Module test progress tracker for the student portal", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

fn parse_year(value: &str) -> Result<CohortYear, String> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(CohortYear::from_index)
        .ok_or_else(|| format!("cohort year must be 1 or 2, got `{value}`"))
}

#[derive(Subcommand)]
enum Commands {
    /// Replay graded submissions from a CSV file without a database
    Simulate {
        #[arg(long)]
        csv: PathBuf,
    },
    #[command(flatten)]
    Db(DbCommands),
}

/// Commands that run against Postgres.
#[derive(Subcommand)]
enum DbCommands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load the demo student roster
    Seed,
    /// Import historical test records from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Grade and save a module test
    #[command(group(
        ArgGroup::new("scoring")
            .args(["answer_key", "total"])
            .required(true)
            .multiple(false)
    ))]
    Submit {
        #[arg(long)]
        student: String,
        #[arg(long, value_parser = parse_year)]
        year: CohortYear,
        #[arg(long)]
        module: u32,
        /// Comma separated answer key in question order
        #[arg(long, requires = "answers")]
        answer_key: Option<String>,
        /// Comma separated answers in question order
        #[arg(long)]
        answers: Option<String>,
        #[arg(long, requires = "correct")]
        total: Option<i64>,
        #[arg(long)]
        correct: Option<i64>,
    },
    /// Show module statuses for a student-year
    Dashboard {
        #[arg(long)]
        student: String,
        #[arg(long, value_parser = parse_year)]
        year: CohortYear,
    },
    /// List every attempt of a module test
    History {
        #[arg(long)]
        student: String,
        #[arg(long, value_parser = parse_year)]
        year: CohortYear,
        #[arg(long)]
        module: u32,
    },
    /// Allow a module to be retaken from a clean attempt count
    ResetAttempts {
        #[arg(long)]
        student: String,
        #[arg(long, value_parser = parse_year)]
        year: CohortYear,
        #[arg(long)]
        module: u32,
    },
    /// List or search students
    Students {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, value_parser = parse_year)]
        year: Option<CohortYear>,
        /// all, active or penalized
        #[arg(long, default_value = "all")]
        status: String,
        /// Show the most recently active students instead
        #[arg(long)]
        recent: Option<usize>,
    },
    /// Edit a student profile; identity fields cannot be changed
    UpdateStudent {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        national_id: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        age: Option<u32>,
        #[arg(long, value_parser = parse_year)]
        year: Option<CohortYear>,
        #[arg(long)]
        penalized: Option<bool>,
        #[arg(long)]
        penalty_reason: Option<String>,
    },
    /// Directory statistics, or attempt statistics for one student-year
    #[command(group(ArgGroup::new("target").args(["student"]).requires("year")))]
    Stats {
        #[arg(long)]
        student: Option<String>,
        #[arg(long, value_parser = parse_year)]
        year: Option<CohortYear>,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Recompute stored aggregates and report drift
    Audit,
}

fn print_dashboard(student: &str, dashboard: &Dashboard) {
    let freshness = match dashboard.freshness {
        Freshness::Live => "",
        Freshness::Stale => " (cached, store unavailable)",
        Freshness::Fallback => " (store unavailable)",
    };
    println!("{} for {student}{freshness}", dashboard.year_title);
    for module in &dashboard.modules {
        println!(
            "- {}. {} [{}] {}% ({} attempts)",
            module.number,
            module.title,
            module.status.label(),
            module.percentage,
            module.attempts
        );
    }
    println!(
        "Progress {}%: {} approved, {} failed, avg {}%, best {}%",
        dashboard.progress_percent,
        dashboard.stats.approved,
        dashboard.stats.failed,
        dashboard.stats.average_percentage,
        dashboard.stats.best_percentage
    );
    if !dashboard.next_modules.is_empty() {
        println!("Next up: {:?}", dashboard.next_modules);
    }
    if dashboard.can_download_certificate {
        println!("Certificate available.");
    }
}

fn simulated_student(id: &str, year: CohortYear) -> Student {
    Student {
        id: id.to_string(),
        full_name: id.replace('-', " "),
        email: format!("{id}@simulation.local"),
        username: id.to_string(),
        national_id: String::new(),
        phone: String::new(),
        age: None,
        cohort_year: year,
        role: Role::Student,
        penalized: false,
        penalty_reason: String::new(),
        registered_at: None,
        last_access: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_new(&settings.log_filter)
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Simulate { csv } => simulate(&csv, &settings).await,
        Commands::Db(command) => run(command, &settings).await,
    }
}

/// Replays graded sheets through the service over an in-memory store.
async fn simulate(csv: &Path, settings: &Settings) -> anyhow::Result<()> {
    let file = File::open(csv).with_context(|| format!("failed to open {}", csv.display()))?;
    let rows = import::read_simulation(file)?;
    let store = Arc::new(MemoryStore::new());
    let service = ProgressService::new(store.clone(), settings.max_attempts);

    let mut seen = BTreeSet::new();
    for row in &rows {
        if seen.insert(row.student_id.clone()) {
            store
                .upsert_student(&simulated_student(&row.student_id, row.year))
                .await?;
        }
        let result = service
            .submit_test(&row.student_id, row.year, row.module, &row.submission)
            .await
            .with_context(|| format!("replaying module {} for {}", row.module, row.student_id))?;
        println!(
            "{} {} module {}: {}/{} = {}% attempt {}",
            row.student_id,
            row.year,
            row.module,
            row.sheet.correct,
            row.sheet.total,
            result.record.percentage,
            result.record.attempt_number
        );
    }

    let years: BTreeSet<(String, CohortYear)> =
        rows.iter().map(|row| (row.student_id.clone(), row.year)).collect();
    for (student, year) in years {
        println!();
        print_dashboard(&student, &service.get_dashboard(&student, year).await);
    }

    Ok(())
}

async fn run(command: DbCommands, settings: &Settings) -> anyhow::Result<()> {
    let pool = settings.connect().await?;
    let store = Arc::new(db::PgStore::new(pool.clone()));
    let service = ProgressService::new(store.clone(), settings.max_attempts);

    match command {
        DbCommands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        DbCommands::Seed => {
            let students = db::seed(&pool).await?;
            println!("Seeded {} students.", students.len());
        }
        DbCommands::Import { csv } => {
            let file = File::open(&csv).with_context(|| format!("failed to open {}", csv.display()))?;
            let rows = import::read_legacy(file)?;
            let (mut imported, mut present, mut unresolved, mut invalid, mut unknown) = (0usize, 0usize, 0usize, 0usize, 0usize);
            for row in &rows {
                match service.import_legacy(&row.student_id, row.year, &row.record).await {
                    Ok(ImportOutcome::Imported { .. }) => imported += 1,
                    Ok(ImportOutcome::AlreadyPresent { .. }) => present += 1,
                    Ok(ImportOutcome::Unresolved) => unresolved += 1,
                    Ok(ImportOutcome::Invalid { .. }) => invalid += 1,
                    Err(ProgressError::StudentNotFound(_)) => unknown += 1,
                    Err(err) => return Err(err.into()),
                }
            }
            println!(
                "Imported {imported} records from {} ({present} already present, {unresolved} unresolved, {invalid} invalid, {unknown} for unknown students).",
                csv.display()
            );
        }
        DbCommands::Submit {
            student,
            year,
            module,
            answer_key,
            answers,
            total,
            correct,
        } => {
            let submission = match (answer_key, total) {
                (Some(answer_key), _) => {
                    let key: Vec<String> = answer_key.split(',').map(|v| v.trim().to_string()).collect();
                    let answers = scoring::parse_answer_list(answers.as_deref().unwrap_or_default());
                    scoring::grade(&key, &answers).into_submission(answers)
                }
                (None, total) => Submission {
                    total_questions: total.unwrap_or_default(),
                    correct_count: correct.unwrap_or_default(),
                    answers: Default::default(),
                },
            };

            let result = service.submit_test(&student, year, module, &submission).await?;
            let verdict = if result.record.approved { "approved" } else { "not approved" };
            println!(
                "Module {module}: {}% {verdict} (attempt {}).",
                result.record.percentage, result.record.attempt_number
            );
            if result.is_retake() {
                println!("Change from previous attempt: {:+} points.", result.improvement());
            }
            if let Some(drift) = &result.drift {
                println!(
                    "Repaired approved modules: {:?} -> {:?}.",
                    drift.projected, drift.recomputed
                );
            }
        }
        DbCommands::Dashboard { student, year } => {
            print_dashboard(&student, &service.get_dashboard(&student, year).await);
        }
        DbCommands::History {
            student,
            year,
            module,
        } => {
            let history = service.attempt_history(&student, year, module).await?;
            if history.is_empty() {
                println!("Module {module} has not been attempted.");
            }
            for entry in &history {
                println!(
                    "- {} {}% {}",
                    entry.completed_at.format("%Y-%m-%d %H:%M"),
                    entry.percentage,
                    if entry.approved { "approved" } else { "failed" }
                );
            }
            let eligibility = service.retake_eligibility(&student, year, module).await?;
            if !eligibility.can_retake {
                println!("No retakes left ({} of {:?}).", eligibility.attempts, eligibility.max_attempts);
            }
        }
        DbCommands::ResetAttempts {
            student,
            year,
            module,
        } => {
            if service.reset_attempts(&student, year, module).await? {
                println!("Attempts for module {module} reset.");
            } else {
                println!("Module {module} has no saved test.");
            }
        }
        DbCommands::Students {
            search,
            year,
            status,
            recent,
        } => {
            let status = directory::StatusFilter::parse(&status)
                .with_context(|| format!("unknown status filter `{status}`"))?;
            let everyone = store.list_students().await?;
            let students = directory::students_only(&everyone, &settings.admin_emails);
            let listed = match recent {
                Some(limit) => directory::recent(&students, limit),
                None => directory::search(
                    &students,
                    &directory::StudentQuery {
                        term: search,
                        year,
                        status,
                    },
                ),
            };

            if listed.is_empty() {
                println!("No students found.");
            }
            for student in &listed {
                let flag = if student.penalized { " [penalized]" } else { "" };
                println!(
                    "- {} ({}, {}, {}){}",
                    student.full_name, student.email, student.username, student.cohort_year, flag
                );
            }
        }
        DbCommands::UpdateStudent {
            id,
            name,
            username,
            national_id,
            phone,
            age,
            year,
            penalized,
            penalty_reason,
        } => {
            let patch = StudentPatch {
                full_name: name,
                username,
                national_id,
                phone,
                age,
                cohort_year: year,
                penalized,
                penalty_reason,
            };
            if store.update_student(&id, &patch, Utc::now()).await? {
                println!("Student {id} updated.");
            } else {
                println!("No student with id {id}.");
            }
        }
        DbCommands::Stats { student, year } => match (student, year) {
            (Some(student), Some(year)) => {
                let stats = service.attempt_stats(&student, year).await?;
                println!(
                    "{} modules attempted, {} attempts (avg {:.1}), {} retaken.",
                    stats.attempted_modules,
                    stats.total_attempts,
                    stats.average_attempts(),
                    stats.modules_with_retakes
                );
            }
            _ => {
                let everyone = store.list_students().await?;
                let students = directory::students_only(&everyone, &settings.admin_emails);
                let stats = directory::directory_stats(&students, Utc::now());
                println!(
                    "{} students, {} active, {} penalized, {}% activity, {} new this month.",
                    stats.total, stats.active, stats.penalized, stats.activity_rate, stats.new_this_month
                );
                for (year, count) in &stats.by_year {
                    println!("- {}: {count}", catalog::Catalog::for_year(*year).title);
                }
            }
        },
        DbCommands::Report { out } => {
            let now = Utc::now();
            let everyone = store.list_students().await?;
            let students = directory::students_only(&everyone, &settings.admin_emails);
            let mut summaries = Vec::new();
            for (student_id, year) in store.list_years().await? {
                if !students.iter().any(|student| student.id == student_id) {
                    continue;
                }
                if let Some(summary) = store.load_year(&student_id, year).await?.summary {
                    summaries.push((year, summary));
                }
            }
            let report = report::build_report(
                now,
                &directory::directory_stats(&students, now),
                &report::summarize_years(&summaries),
                &students,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        DbCommands::Audit => {
            let findings = service.audit().await?;
            if findings.is_empty() {
                println!("All stored aggregates match their records.");
            }
            for finding in &findings {
                println!("{} {}:", finding.student_id, finding.year);
                for problem in &finding.problems {
                    println!("  - {problem}");
                }
            }
        }
    }

    Ok(())
}
