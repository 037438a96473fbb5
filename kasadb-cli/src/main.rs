//! `KasaDB` CLI tool for key management and field encryption.

#![warn(clippy::pedantic, clippy::nursery)]

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kasadb::prelude::*;
use kasadb_key_file::FileKeyProvider;
use kasadb_kms_aws::AwsKmsProvider;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kasadb")]
#[command(about = "KasaDB key management and field encryption CLI", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "kasadb.json")]
    config: PathBuf,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new local master key file
    InitMasterKey {
        /// Where to write the key
        #[arg(short, long, default_value = "./master.key")]
        output: PathBuf,
    },
    /// Create a data key in the key vault
    CreateKey {
        /// Alternate names for the key
        #[arg(short, long = "alt-name")]
        alt_names: Vec<String>,
        /// Wrap with this AWS KMS key instead of the local master key
        #[arg(long)]
        aws_key: Option<String>,
    },
    /// List data keys in the key vault
    ListKeys,
    /// Encrypt a document for insertion into a namespace
    Encrypt {
        /// Target namespace, `db.coll`
        #[arg(short, long)]
        namespace: Namespace,
        /// JSON document; stdin when omitted
        input: Option<PathBuf>,
    },
    /// Decrypt a document read from a namespace
    Decrypt {
        /// Source namespace, `db.coll`
        #[arg(short, long)]
        namespace: Namespace,
        /// JSON document; stdin when omitted
        input: Option<PathBuf>,
    },
    /// Rewrite a query filter against encrypted fields
    RewriteFilter {
        /// Target namespace, `db.coll`
        #[arg(short, long)]
        namespace: Namespace,
        /// JSON filter; stdin when omitted
        input: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::InitMasterKey { output } => {
            FileKeyProvider::init(&output)
                .with_context(|| format!("failed to create master key {}", output.display()))?;
            println!("Created master key: {}", output.display());
        }
        Commands::CreateKey { alt_names, aws_key } => {
            let config = load_config(&cli.config)?;
            let client = ClientEncryption::from_encrypter(open_encrypter(&config)?);
            let master_key = match aws_key {
                Some(key) => {
                    let aws =
                        config.kms_providers.aws.as_ref().context("no aws provider configured")?;
                    MasterKeyRef::Aws {
                        region: aws.region.clone(),
                        key,
                        endpoint: aws.endpoint.clone(),
                    }
                }
                None => MasterKeyRef::Local,
            };
            let id = client
                .create_data_key(master_key, alt_names)
                .context("failed to create data key")?;
            println!("{id}");
        }
        Commands::ListKeys => {
            let config = load_config(&cli.config)?;
            let keys = open_encrypter(&config)?.vault().list_keys().context("failed to list keys")?;
            for key in keys {
                let names: Vec<&str> = key.key_alt_names.iter().map(String::as_str).collect();
                println!(
                    "{}\t{}\t{}\t{}",
                    key.id,
                    key.master_key.kind(),
                    key.creation_date.to_rfc3339(),
                    names.join(",")
                );
            }
        }
        Commands::Encrypt { namespace, input } => {
            let auto = auto_encrypter(&cli.config)?;
            let doc = read_document(input.as_deref())?;
            let encrypted =
                auto.encrypt_for_insert(&namespace, &doc).context("failed to encrypt document")?;
            print_json(&encrypted.to_json())?;
        }
        Commands::Decrypt { namespace, input } => {
            let auto = auto_encrypter(&cli.config)?;
            let doc = read_document(input.as_deref())?;
            let decrypted =
                auto.decrypt_result(&namespace, &doc).context("failed to decrypt document")?;
            print_json(&decrypted.to_json())?;
        }
        Commands::RewriteFilter { namespace, input } => {
            let auto = auto_encrypter(&cli.config)?;
            let doc = read_document(input.as_deref())?;
            let filter = Predicate::from_document(&doc).context("invalid filter")?;
            let rewritten =
                auto.rewrite_filter(&namespace, &filter).context("failed to rewrite filter")?;
            print_json(&rewritten.to_document().to_json())?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn load_config(path: &Path) -> Result<AutoEncryptionConfig> {
    AutoEncryptionConfig::from_file(path)
        .with_context(|| format!("failed to load config {}", path.display()))
}

fn providers(config: &AutoEncryptionConfig) -> Result<KmsProviders> {
    let mut providers = KmsProviders::new();
    if let Some(local) = &config.kms_providers.local {
        let provider = FileKeyProvider::new(&local.key_path)
            .with_context(|| format!("failed to load master key {}", local.key_path.display()))?;
        providers = providers.with(provider);
    }
    if let Some(aws) = &config.kms_providers.aws {
        let provider = AwsKmsProvider::with_endpoint(aws.region.as_str(), aws.endpoint.clone())
            .context("failed to set up AWS KMS")?;
        providers = providers.with(provider);
    }
    if !providers.contains(ProviderKind::Local) && !providers.contains(ProviderKind::Aws) {
        bail!("no kmsProviders configured");
    }
    Ok(providers)
}

fn open_encrypter(config: &AutoEncryptionConfig) -> Result<Encrypter<FileKeyVault>> {
    let vault = config.open_key_vault().context("failed to open key vault")?;
    debug!(
        path = %vault.path().display(),
        namespace = %config.key_vault_namespace,
        "opened key vault"
    );
    Ok(Encrypter::new(Arc::new(vault), providers(config)?))
}

fn auto_encrypter(path: &Path) -> Result<AutoEncrypter<FileKeyVault>> {
    let config = load_config(path)?;
    let schemas = config.compile_schema_map().context("invalid schemaMap")?;
    let auto = AutoEncrypter::new(open_encrypter(&config)?, schemas);
    Ok(auto.bypass_auto_encryption(config.bypass_auto_encryption))
}

fn read_document(input: Option<&Path>) -> Result<Document> {
    let text = match input {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text).context("failed to read stdin")?;
            text
        }
    };
    let json: serde_json::Value = serde_json::from_str(&text).context("input is not valid JSON")?;
    Document::from_json(json).context("input is not a document")
}

fn print_json(json: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(json)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_encrypt() {
        let args = ["kasadb", "-c", "cfg.json", "encrypt", "-n", "medicalRecords.patients"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.config, PathBuf::from("cfg.json"));
        match cli.command {
            Commands::Encrypt { namespace, input } => {
                assert_eq!(namespace.coll(), "patients");
                assert!(input.is_none());
            }
            _ => panic!("expected encrypt"),
        }
        assert!(Cli::try_parse_from(["kasadb", "encrypt", "-n", "nodot"]).is_err());
    }

    #[test]
    fn test_end_to_end_through_config() {
        let dir = tempfile::tempdir().unwrap();
        FileKeyProvider::init(dir.path().join("master.key")).unwrap();
        let config_path = dir.path().join("kasadb.json");
        let mut config = serde_json::json!({
            "keyVaultPath": "keys.json",
            "kmsProviders": { "local": { "keyPath": "master.key" } },
            "schemaMap": {}
        });
        fs::write(&config_path, config.to_string()).unwrap();

        let loaded = load_config(&config_path).unwrap();
        let client = ClientEncryption::from_encrypter(open_encrypter(&loaded).unwrap());
        client.create_data_key(MasterKeyRef::Local, ["cli-key"]).unwrap();

        config["schemaMap"] = serde_json::json!({
            "app.users": {
                "bsonType": "object",
                "properties": {
                    "email": { "encrypt": {
                        "bsonType": "string",
                        "algorithm": "AEAD_AES_256_GCM_HMAC_SHA_512-Deterministic",
                        "keyId": "cli-key"
                    } }
                }
            }
        });
        fs::write(&config_path, config.to_string()).unwrap();

        let auto = auto_encrypter(&config_path).unwrap();
        let ns: Namespace = "app.users".parse().unwrap();
        let doc = Document::from_json(serde_json::json!({ "email": "a@example.com" })).unwrap();
        let encrypted = auto.encrypt_for_insert(&ns, &doc).unwrap();
        assert!(encrypted.get("email").unwrap().is_encrypted());
        assert_eq!(auto.decrypt_result(&ns, &encrypted).unwrap(), doc);
    }

    #[test]
    fn test_missing_providers_rejected() {
        let config = AutoEncryptionConfig::default();
        assert!(providers(&config).is_err());
    }
}
