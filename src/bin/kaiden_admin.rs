use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use kaiden::{
    config::Config,
    course::{catalog::Catalog, progression::Progression},
    db,
    gamification::{Rank, economy::Economy},
    legacy::{self, JsonLinesDirectory},
    shop::Shop,
    student::{create_student, delete_student, get_student_list},
    utils::{Clock, SystemClock, init_log},
};

#[derive(Debug, clap::Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "kaiden.toml")]
    config: PathBuf,
    /// Overrides the database path of the config file
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    Course {
        #[command(subcommand)]
        command: CourseCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Product {
        #[command(subcommand)]
        command: ProductCommand,
    },
    /// Enrolls a student in a course
    Enroll { student: i64, course: i64 },
    /// Prints a student's course page as JSON
    Progress { student: i64, course: i64 },
    /// Deletes all progress of a student in a course
    Format { student: i64, course: i64 },
    /// Pulls rank and balances from the legacy export
    Reconcile { student: i64 },
}

#[derive(Debug, clap::Subcommand)]
enum CourseCommand {
    List,
    Import {
        file: PathBuf,
        #[arg(long)]
        replace: bool,
    },
    ImportDir {
        dir: PathBuf,
        #[arg(long)]
        replace: bool,
    },
    Remove { id: i64 },
}

#[derive(Debug, clap::Subcommand)]
enum UserCommand {
    List,
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
        #[arg(short, long, default_value = "お試し")]
        rank: Rank,
    },
    Delete {
        id: i64,
    },
    Rank {
        id: i64,
        rank: Rank,
    },
    Gems {
        id: i64,
        #[arg(allow_hyphen_values = true)]
        delta: i64,
        #[arg(short, long, default_value = "manual adjustment")]
        reason: String,
    },
}

#[derive(Debug, clap::Subcommand)]
enum ProductCommand {
    List,
    Add {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        price: i64,
        /// Unlimited when omitted
        #[arg(short, long)]
        stock: Option<i64>,
    },
}

#[tokio::main]
async fn main() {
    let _guard = init_log(None);
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{:?}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = Config::load(&args.config)?;
    if let Some(database) = args.database {
        config.database.path = database;
    }
    let database = db::connect(&config.database.path, config.database.max_connections).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let catalog = Arc::new(Catalog::new(database.clone()));
    let progression = Progression::new(
        database.clone(),
        catalog.clone(),
        config.grading.clone(),
        clock.clone(),
    );
    let economy = Economy::new(database.clone(), config.gamification.clone(), clock.clone());
    let shop = Shop::new(database.clone(), clock.clone());

    match args.command {
        Commands::Course { command } => match command {
            CourseCommand::List => {
                for course in catalog.list_courses().await? {
                    println!(
                        "{:<8} {:<24} {:<8} {}",
                        course.id, course.slug, course.required_rank, course.title
                    );
                }
            }
            CourseCommand::Import { file, replace } => {
                let id = catalog.import_file(&file, replace).await?;
                println!("Course imported from {} with id: {}", file.display(), id);
            }
            CourseCommand::ImportDir { dir, replace } => {
                let ids = catalog.import_dir(&dir, replace).await;
                println!("Imported {} courses from {}", ids.len(), dir.display());
            }
            CourseCommand::Remove { id } => {
                catalog.remove_course(id).await?;
                println!("Course removed with id: {}", id);
            }
        },
        Commands::User { command } => match command {
            UserCommand::List => {
                for s in get_student_list(&database, &config.gamification).await? {
                    println!(
                        "{:<8} {:<20} {:<28} {:<6} lv{:<4} {:>8}xp {:>6}gems",
                        s.id, s.name, s.email, s.rank, s.level, s.experience, s.gems
                    );
                }
            }
            UserCommand::Create {
                name,
                email,
                password,
                rank,
            } => {
                let id =
                    create_student(&database, &name, &email, &password, rank, clock.now()).await?;
                println!("Student created with id: {}", id);
            }
            UserCommand::Delete { id } => {
                delete_student(&database, id).await?;
                println!("Student deleted with id: {}", id);
            }
            UserCommand::Rank { id, rank } => {
                economy.set_rank(id, rank).await?;
                println!("Student {} is now {}", id, rank);
            }
            UserCommand::Gems { id, delta, reason } => {
                let balance = economy.adjust_gems(id, delta, &reason).await?;
                println!("Student {} now has {} gems", id, balance);
            }
        },
        Commands::Product { command } => match command {
            ProductCommand::List => {
                for p in shop.list_products().await? {
                    let stock = p.stock.map_or("unlimited".to_string(), |s| s.to_string());
                    println!("{:<8} {:<24} {:>6}gems {}", p.id, p.name, p.price, stock);
                }
            }
            ProductCommand::Add { name, price, stock } => {
                let id = shop.add_product(&name, price, stock).await?;
                println!("Product added with id: {}", id);
            }
        },
        Commands::Enroll { student, course } => {
            let enrollment = progression.enroll(student, course).await?;
            println!("{}", serde_json::to_string_pretty(&enrollment)?);
        }
        Commands::Progress { student, course } => {
            let view = progression.course_view(student, course).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Format { student, course } => {
            progression.format_course(student, course).await?;
            println!("Progress of student {} in course {} deleted", student, course);
        }
        Commands::Reconcile { student } => {
            let Some(path) = config.legacy.export_path.clone() else {
                anyhow::bail!("no [legacy] export_path configured");
            };
            let directory = JsonLinesDirectory::new(path);
            let outcome = legacy::reconcile(&database, &directory, student, clock.now()).await?;
            println!("{:#?}", outcome);
        }
    }
    db::shutdown(database).await;
    Ok(())
}
