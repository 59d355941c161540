// Statement Ingest - operator CLI
// upload → process → review → check-duplicates → import, straight from the terminal

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use statement_ingest::logging::init_logging;
use statement_ingest::{BackendKind, CandidateTransaction, Config, Document, Pipeline, UploadRequest};

#[derive(Parser)]
#[command(name = "statement-ingest", version, about = "Bank statement extraction and staging")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    Init,
    /// Store a statement PDF for processing
    Upload {
        file: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        account: Option<String>,
    },
    /// Extract transactions from an uploaded document
    Process {
        document_id: String,
        /// ollama | openai | mock (default: configured backend)
        #[arg(long)]
        backend: Option<String>,
    },
    /// Show a document and its staged transactions
    Show { document_id: String },
    /// List a user's documents
    List { user: String },
    /// Approve pending transactions
    Approve {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Reject pending or approved transactions
    Reject {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Flag staged transactions that already exist in the ledger
    CheckDuplicates {
        document_id: String,
        #[arg(long)]
        user: String,
    },
    /// Import approved transactions into the ledger
    Import {
        document_id: String,
        #[arg(long)]
        budget: Option<String>,
    },
    /// Review totals for a document
    Summary { document_id: String },
    /// List extraction backends and their availability
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    init_logging(&config.logging);

    let pipeline = Pipeline::from_config(&config)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))?;

    match cli.command {
        Command::Init => {
            println!("🗄️  Database ready: {}", config.database.path.display());
            println!("📂 Uploads: {}", config.storage.upload_dir.display());
        }
        Command::Upload { file, user, account } => run_upload(&pipeline, file, user, account).await?,
        Command::Process { document_id, backend } => run_process(&pipeline, &document_id, backend).await?,
        Command::Show { document_id } => {
            let detail = pipeline.document_detail(&document_id)?;
            print_document(&detail.document);
            println!();
            for tx in &detail.transactions {
                print_candidate(tx);
            }
        }
        Command::List { user } => {
            let documents = pipeline.list_user_documents(&user)?;
            println!("📄 {} documents for {}", documents.len(), user);
            for doc in &documents {
                println!(
                    "  {}  {:<10}  {:>3} txns  {}",
                    doc.id, doc.status, doc.transaction_count, doc.original_name
                );
            }
        }
        Command::Approve { ids } => {
            for id in &ids {
                match pipeline.approve(id) {
                    Ok(()) => println!("✓ Approved {}", id),
                    Err(e) => eprintln!("❌ {}: {}", id, e),
                }
            }
        }
        Command::Reject { ids } => {
            for id in &ids {
                match pipeline.reject(id) {
                    Ok(()) => println!("✓ Rejected {}", id),
                    Err(e) => eprintln!("❌ {}: {}", id, e),
                }
            }
        }
        Command::CheckDuplicates { document_id, user } => {
            let report = pipeline.check_duplicates(&document_id, &user)?;
            println!(
                "🔍 Checked {} pending transactions, {} duplicates",
                report.total_checked, report.duplicates_found
            );
            for finding in &report.duplicates {
                println!(
                    "  ⚠️  {} {} {:.2} matches {} ledger row(s)",
                    finding.pending_date,
                    finding.pending_description,
                    finding.pending_amount,
                    finding.potential_duplicates.len()
                );
            }
        }
        Command::Import { document_id, budget } => {
            let outcome = pipeline.import(&document_id, budget.as_deref())?;
            println!("✅ Imported {} transactions", outcome.imported_count);
        }
        Command::Summary { document_id } => {
            let summary = pipeline.summary(&document_id)?;
            println!("📊 Review summary for {}", document_id);
            for (status, totals) in &summary.by_status {
                println!("  {:<10} {:>3}  {:>10.2}", status.as_str(), totals.count, totals.total);
            }
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            for category in &summary.by_category {
                println!("  {:<16} {:>3}  {:>10.2}", category.category, category.count, category.total);
            }
            println!("\nReady to import: {}", summary.ready_to_import);
        }
        Command::Providers => {
            let registry = pipeline.registry();
            for provider in registry.describe().await {
                let marker = if provider.available { "✓" } else { "✗" };
                let default = if registry.default_kind() == Some(provider.id) { " (default)" } else { "" };
                println!("{} {} [{}]{} - {}", marker, provider.name, provider.model, default, provider.description);
                if !provider.available {
                    for step in &provider.setup_steps {
                        println!("    • {}", step);
                    }
                }
            }
        }
    }

    pipeline.close()?;
    Ok(())
}

async fn run_upload(pipeline: &Pipeline, file: PathBuf, user: String, account: Option<String>) -> Result<()> {
    let bytes = tokio::fs::read(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let is_pdf = file
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    let content_type = if is_pdf { "application/pdf" } else { "application/octet-stream" };

    let original_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "statement.pdf".to_string());

    let receipt = pipeline
        .upload(UploadRequest {
            bytes,
            original_name,
            content_type: content_type.to_string(),
            owner: user,
            bank_account_id: account,
        })
        .await?;

    println!("📄 Uploaded {} ({} bytes)", receipt.filename, receipt.size);
    println!("   Document: {}", receipt.document_id);
    println!("   Next: statement-ingest process {}", receipt.document_id);
    Ok(())
}

async fn run_process(pipeline: &Pipeline, document_id: &str, backend: Option<String>) -> Result<()> {
    let requested = backend
        .as_deref()
        .map(str::parse::<BackendKind>)
        .transpose()?;

    println!("🔄 Processing {}...", document_id);
    let outcome = pipeline.process(document_id, requested).await?;

    if outcome.success {
        println!(
            "✅ {} transactions extracted by {} ({}) in {} ms",
            outcome.transaction_count, outcome.provider, outcome.model, outcome.processing_time_ms
        );
        if let Some(bank) = &outcome.statement_info.bank_name {
            println!("   Bank: {}", bank);
        }
    } else {
        eprintln!("❌ Extraction failed: {}", outcome.error.unwrap_or_default());
    }
    Ok(())
}

fn print_document(doc: &Document) {
    println!("📄 {} ({})", doc.original_name, doc.id);
    println!("   Status:       {}", doc.status);
    println!("   Owner:        {}", doc.user_id);
    println!("   Transactions: {}", doc.transaction_count);
    if let Some(provider) = &doc.llm_provider {
        println!("   Backend:      {} / {}", provider, doc.llm_model.as_deref().unwrap_or("-"));
    }
    if let (Some(start), Some(end)) = (&doc.statement_start_date, &doc.statement_end_date) {
        println!("   Period:       {} → {}", start, end);
    }
    if let Some(error) = &doc.processing_error {
        println!("   Error:        {}", error);
    }
}

fn print_candidate(tx: &CandidateTransaction) {
    println!(
        "  {}  {}  {:<32}  {:>10.2}  {:<8}  {:<14}  {}",
        tx.id,
        tx.date,
        tx.description,
        tx.amount,
        tx.transaction_type.as_str(),
        tx.effective_category().unwrap_or("-"),
        tx.status.as_str()
    );
}
