use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cratedoc_core::collection::{CollectionDump, ImportMode};
use cratedoc_core::database::{Database, DatabaseDump, DatabaseOptions};
use cratedoc_core::index::IndexDef;
use cratedoc_core::kv::{KvStore, MemoryKv};
use cratedoc_core::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cratedoc")]
#[command(about = "cratedoc CLI - command-line interface for the cratedoc document database")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import documents from a JSON file into the database directory
    Import {
        /// JSON file shaped `{ "collection_name": [documents...], ... }`
        file: PathBuf,
        /// Database directory (holds data.json and per-collection schemas)
        #[arg(long, default_value = "cratedoc.db")]
        db: PathBuf,
        /// Fail on an id that already exists instead of overwriting it
        #[arg(long)]
        insert_only: bool,
    },
    /// Dump the database (documents and attachments) to a JSON file
    Dump {
        /// Output JSON file
        file: PathBuf,
        /// Database directory
        #[arg(long, default_value = "cratedoc.db")]
        db: PathBuf,
        /// Dump only one collection
        #[arg(long)]
        collection: Option<String>,
    },
    /// Schema management commands
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },
}

#[derive(Subcommand)]
enum SchemaAction {
    /// Print a collection's schema as JSON
    Show {
        /// Database directory
        #[arg(long, default_value = "cratedoc.db")]
        db: PathBuf,
        /// Collection name
        #[arg(long)]
        collection: String,
    },
    /// Replace a collection's schema from a JSON file, migrating in place
    Set {
        /// Schema file (see `SchemaFile`'s shape)
        file: PathBuf,
        /// Database directory
        #[arg(long, default_value = "cratedoc.db")]
        db: PathBuf,
        /// Collection name
        #[arg(long)]
        collection: String,
    },
}

/// On-disk schema shape the CLI reads/writes: the persistable parts of
/// [`Schema`] plus the one field `SchemaSnapshot` doesn't carry - the
/// validation document - so `schema show`/`schema set` round-trip a
/// collection's full schema, not just its index/version drift surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SchemaFile {
    version: u64,
    primary_key: Vec<String>,
    rev_field: String,
    #[serde(default)]
    indexes: Vec<IndexDef>,
    #[serde(default)]
    encrypted_fields: Vec<String>,
    #[serde(default)]
    validation: Option<Value>,
}

impl SchemaFile {
    fn default_for_new_collection() -> Self {
        SchemaFile { version: 1, primary_key: vec!["_id".into()], rev_field: "_rev".into(), indexes: Vec::new(), encrypted_fields: Vec::new(), validation: None }
    }

    fn into_schema(self) -> Schema {
        let mut schema = Schema::new(self.primary_key, self.rev_field)
            .with_indexes(self.indexes)
            .with_encrypted_fields(self.encrypted_fields)
            .with_version(self.version);
        if let Some(validation) = self.validation {
            schema = schema.with_validation(validation);
        }
        schema
    }

    fn from_schema(schema: &Schema) -> Self {
        SchemaFile {
            version: schema.version,
            primary_key: schema.primary_key.clone(),
            rev_field: schema.rev_field.clone(),
            indexes: schema.indexes.clone(),
            encrypted_fields: schema.encrypted_fields.clone(),
            validation: schema.validation.clone(),
        }
    }
}

fn schemas_dir(db: &Path) -> PathBuf {
    db.join("schemas")
}

fn data_file(db: &Path) -> PathBuf {
    db.join("data.json")
}

fn schema_file_path(db: &Path, collection: &str) -> PathBuf {
    schemas_dir(db).join(format!("{collection}.schema.json"))
}

/// Every collection with a persisted schema file, in file-listing order.
fn known_collections(db: &Path) -> Result<Vec<String>> {
    let dir = schemas_dir(db);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(collection) = name.strip_suffix(".schema.json") {
                names.push(collection.to_string());
            }
        }
    }
    Ok(names)
}

fn read_schema_file(db: &Path, collection: &str) -> Result<Option<SchemaFile>> {
    let path = schema_file_path(db, collection);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Some(serde_json::from_str(&content).with_context(|| format!("invalid schema JSON in {}", path.display()))?))
}

fn write_schema_file(db: &Path, collection: &str, schema_file: &SchemaFile) -> Result<()> {
    let dir = schemas_dir(db);
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = schema_file_path(db, collection);
    let json = serde_json::to_string_pretty(schema_file)?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
}

/// Open every collection this database directory knows about (one per
/// `schemas/*.schema.json` file), then replay `data.json` into them. Running
/// `Database::collection` against each schema is what actually performs
/// migration if a schema file was edited between runs.
fn open_database(db: &Path) -> Result<Database> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let database = Database::open(kv, DatabaseOptions { name: db.display().to_string(), path: db.to_path_buf(), ..Default::default() });

    for name in known_collections(db)? {
        let schema_file = read_schema_file(db, &name)?.unwrap_or_default();
        database.collection(&name, schema_file.into_schema())?;
    }

    let data_path = data_file(db);
    if data_path.exists() {
        let content = fs::read_to_string(&data_path).with_context(|| format!("failed to read {}", data_path.display()))?;
        let dump: DatabaseDump = serde_json::from_str(&content).with_context(|| format!("invalid dump JSON in {}", data_path.display()))?;
        database.restore(dump, ImportMode::Upsert)?;
    }

    Ok(database)
}

/// Persist every open collection's documents/attachments and schema back to
/// `db`, so the next invocation of the CLI picks up where this one left off.
fn save_database(database: &Database, db: &Path) -> Result<()> {
    fs::create_dir_all(db).with_context(|| format!("failed to create {}", db.display()))?;

    for name in database.list_collections() {
        let coll = database.get_collection(&name)?;
        write_schema_file(db, &name, &SchemaFile::from_schema(&coll.schema()))?;
    }

    let dump = database.backup()?;
    let json = serde_json::to_string_pretty(&dump)?;
    fs::write(data_file(db), json).with_context(|| format!("failed to write {}", data_file(db).display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Import { file, db, insert_only } => import_data(&file, &db, insert_only),
        Commands::Dump { file, db, collection } => dump_data(&file, &db, collection.as_deref()),
        Commands::Schema { action } => match action {
            SchemaAction::Show { db, collection } => schema_show(&db, &collection),
            SchemaAction::Set { file, db, collection } => schema_set(&file, &db, &collection),
        },
    }
}

/// Import data from a JSON file shaped `{ "collection_name": [documents...], ... }`.
/// A collection named here with no existing schema file is created with a
/// minimal default schema (`_id` primary key, `_rev` revision field).
fn import_data(file: &Path, db: &Path, insert_only: bool) -> Result<()> {
    let content = fs::read_to_string(file).with_context(|| format!("failed to read file: {}", file.display()))?;
    let data: Map<String, Value> = serde_json::from_str(&content).with_context(|| format!("invalid JSON in file: {}", file.display()))?;

    let database = open_database(db)?;
    let mode = if insert_only { ImportMode::Insert } else { ImportMode::Upsert };
    let mut total_docs = 0;

    for (collection_name, documents) in data {
        let docs = documents.as_array().with_context(|| format!("collection '{collection_name}' must be an array"))?.clone();

        let schema = read_schema_file(db, &collection_name)?.unwrap_or_else(SchemaFile::default_for_new_collection).into_schema();
        let coll = database.collection(&collection_name, schema)?;
        coll.import_json(docs.clone(), mode).with_context(|| format!("failed to import into {collection_name}"))?;
        total_docs += docs.len();

        println!("Imported {} documents into '{}'", docs.len(), collection_name);
    }

    save_database(&database, db)?;
    println!("Total: {} documents imported to {}", total_docs, db.display());
    Ok(())
}

/// Dump the database (or one collection) to a JSON file, attachments
/// included - spec §6's `Dump`/`ImportDump` shape, not the bare
/// document-array `ExportJSON` shape.
fn dump_data(file: &Path, db: &Path, collection_filter: Option<&str>) -> Result<()> {
    let database = open_database(db)?;
    let mut dump = database.backup()?;

    if let Some(filter) = collection_filter {
        dump.collections.retain(|name, _| name == filter);
    }

    let total_docs: usize = dump.collections.values().map(|c: &CollectionDump| c.documents.len()).sum();
    for (name, coll_dump) in &dump.collections {
        println!("Dumping {} documents from '{}'", coll_dump.documents.len(), name);
    }

    let json = serde_json::to_string_pretty(&dump).with_context(|| "failed to serialize dump")?;
    fs::write(file, json).with_context(|| format!("failed to write to file: {}", file.display()))?;

    println!("Total: {} documents dumped to {}", total_docs, file.display());
    Ok(())
}

fn schema_show(db: &Path, collection: &str) -> Result<()> {
    let database = open_database(db)?;
    let coll = database.get_collection(collection).with_context(|| format!("no such collection: {collection}"))?;
    let schema_file = SchemaFile::from_schema(&coll.schema());
    println!("{}", serde_json::to_string_pretty(&schema_file)?);
    Ok(())
}

/// Replace a collection's schema from a file. Going through
/// `Database::collection` (rather than mutating the open handle directly)
/// is what triggers migration if the new schema drifted from the stored one.
fn schema_set(file: &Path, db: &Path, collection: &str) -> Result<()> {
    let content = fs::read_to_string(file).with_context(|| format!("failed to read: {}", file.display()))?;
    let schema_file: SchemaFile = serde_json::from_str(&content).with_context(|| format!("invalid schema JSON in: {}", file.display()))?;

    let database = open_database(db)?;
    database.collection(collection, schema_file.clone().into_schema())?;
    write_schema_file(db, collection, &schema_file)?;
    save_database(&database, db)?;

    println!("Set schema for '{}' from {}", collection, file.display());
    Ok(())
}
