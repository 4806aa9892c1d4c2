//! xmldb - command-line access to a database directory.

use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use xmldb::db::{Database, DatabaseConfig};
use xmldb::storage::{CollectionConfig, CollectionPath, Content, DocumentName, DocumentPath};

type CliResult<T> = Result<T, Box<dyn Error>>;

fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut path = PathBuf::from(".xmldb");
    let mut command: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-d" | "--database" => {
                i += 1;
                match args.get(i) {
                    Some(dir) => path = PathBuf::from(dir),
                    None => {
                        eprintln!("-d needs a directory");
                        return ExitCode::FAILURE;
                    }
                }
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("xmldb v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg if arg.starts_with('-') && command.is_empty() => {
                eprintln!("Unknown option: {}", arg);
                return ExitCode::FAILURE;
            }
            arg => command.push(arg.to_string()),
        }
        i += 1;
    }

    if command.is_empty() {
        print_help();
        return ExitCode::FAILURE;
    }

    let db = match Database::open(DatabaseConfig::new(&path)) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error opening database: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&db, &command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn print_help() {
    println!("xmldb - transactional XML collection store");
    println!();
    println!("Usage: xmldb [-d DIR] <command> [args]");
    println!();
    println!("Options:");
    println!("  -d, --database DIR     Database directory (default: .xmldb)");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
    println!();
    println!("Commands:");
    println!("  mkcol PATH                       Create a collection and its ancestors");
    println!("  put COLLECTION NAME FILE         Store FILE as COLLECTION/NAME");
    println!("  get PATH                         Print a document");
    println!("  rm PATH                          Remove a document or a collection");
    println!("  ls PATH                          List a collection");
    println!("  query COLLECTION PROVIDER EXPR   Query an index within COLLECTION");
    println!("  configure COLLECTION CONFIG.json Attach a configuration ('-' to clear)");
    println!("  checkpoint                       Snapshot the tree and truncate the journal");
    println!();
    println!("Logging is controlled by RUST_LOG (default: info).");
}

fn run(db: &Database, command: &[String]) -> CliResult<()> {
    let store = db.store();
    let args: Vec<&str> = command.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["mkcol", path] => {
            let path = CollectionPath::new(path)?;
            let created = db.with_transaction(|tx| store.create_collection(tx, &path))?;
            if !created {
                println!("{} already exists", path);
            }
        }
        ["put", collection, name, file] => {
            let collection = CollectionPath::new(collection)?;
            let name = DocumentName::new(*name)?;
            let bytes = fs::read(file)?;
            let content = match String::from_utf8(bytes) {
                Ok(text) if looks_like_xml(&text) => Content::xml(text),
                Ok(text) => Content::binary(text.into_bytes()),
                Err(e) => Content::binary(e.into_bytes()),
            };
            let id = db.with_transaction(|tx| store.store(tx, &collection, &name, content))?;
            println!("stored {}/{} (id {})", collection, name, id);
        }
        ["get", path] => {
            let path = DocumentPath::parse(path)?;
            let document = store.fetch_document(&path)?;
            let mut stdout = io::stdout();
            stdout.write_all(document.content.as_bytes())?;
            if document.content.is_xml() {
                writeln!(stdout)?;
            }
        }
        ["rm", path] => {
            let target = store.resolve(path)?;
            db.with_transaction(|tx| store.remove(tx, &target))?;
            println!("removed {}", target);
        }
        ["ls", path] => {
            let path = CollectionPath::new(path)?;
            let (collections, documents) = db.with_transaction(|tx| {
                Ok((store.list_collections(tx, &path)?, store.list_documents(tx, &path)?))
            })?;
            for collection in collections {
                println!("{}/", collection.name());
            }
            for document in documents {
                println!(
                    "{}\t{}\t{}\tv{}",
                    document.name,
                    document.mime,
                    document.content.len(),
                    document.version
                );
            }
        }
        ["query", collection, provider, expr] => {
            let scope = CollectionPath::new(collection)?;
            let nodes = store.query(&scope, provider, expr)?;
            for node in &nodes {
                println!("{}\t#{}", node.path, node.node);
            }
            println!("({} hits)", nodes.len());
        }
        ["configure", collection, file] => {
            let path = CollectionPath::new(collection)?;
            let config = if *file == "-" {
                None
            } else {
                Some(CollectionConfig::from_json(&fs::read_to_string(file)?)?)
            };
            db.with_transaction(|tx| store.configure_collection(tx, &path, config))?;
            println!("configured {}", path);
        }
        ["checkpoint"] => {
            db.checkpoint()?;
            let stats = db.stats();
            println!(
                "checkpoint at commit {} ({} collections, {} documents)",
                stats.commit_seq, stats.collections, stats.documents
            );
        }
        _ => {
            return Err(format!("unknown command or wrong arguments: {}", command.join(" ")).into());
        }
    }
    Ok(())
}

fn looks_like_xml(text: &str) -> bool {
    text.trim_start().starts_with('<')
}

