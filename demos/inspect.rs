/// Example listing the parts, content types and relationships of an OPC package.
///
/// This example shows:
/// - Opening a package read-only, with configurable zip-bomb limits
/// - Iterating over parts and their relationships
/// - Reading core properties
/// - Mapping error categories to process exit codes
use clap::Parser;
use longan::opc::{ErrorCategory, OpcPackage, PackageAccess, PackageConfig, RelationshipCollection};
use soapberry_zip::ZipLimits;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "inspect", about = "List the contents of an OPC package")]
struct Args {
    /// Package to inspect (.docx, .xlsx, .pptx, ...)
    file: PathBuf,

    /// Minimum compressed/inflated ratio before an entry counts as a zip bomb
    #[arg(long)]
    min_inflate_ratio: Option<f64>,

    /// Maximum inflated size of a single entry, in bytes
    #[arg(long)]
    max_entry_size: Option<u64>,

    /// Also print each part's relationships
    #[arg(short, long)]
    relationships: bool,
}

fn exit_code(category: ErrorCategory) -> u8 {
    match category {
        ErrorCategory::MalformedInput => 2,
        ErrorCategory::Conformance => 3,
        ErrorCategory::Format => 4,
        ErrorCategory::SecurityLimit => 5,
        ErrorCategory::Resource => 6,
        ErrorCategory::ContractViolation => 7,
    }
}

fn print_relationships(rels: &RelationshipCollection, indent: &str) {
    for rel in rels.iter() {
        println!(
            "{indent}{} -> {} ({})",
            rel.id(),
            rel.target(),
            rel.target_mode().as_str()
        );
        println!("{indent}   Type: {}", rel.rel_type());
    }
}

fn inspect(args: &Args) -> longan::Result<()> {
    let mut limits = ZipLimits::global();
    if let Some(ratio) = args.min_inflate_ratio {
        limits = limits.with_min_inflate_ratio(ratio);
    }
    if let Some(size) = args.max_entry_size {
        limits = limits.with_max_entry_size(size);
    }
    let config = PackageConfig::default().with_zip_limits(limits);

    let mut package = OpcPackage::open_with(&args.file, PackageAccess::Read, config)?;

    println!("Package: {}", args.file.display());
    println!("{}", "=".repeat(60));

    println!("\nPackage Relationships:");
    print_relationships(package.relationships()?, "   ");

    println!("\nParts:");
    for part in package.parts()? {
        let size = part
            .size()
            .map_or_else(|| "unknown size".to_string(), |s| format!("{s} bytes"));
        println!("   {} [{}] {}", part.name(), part.content_type(), size);
        if args.relationships {
            print_relationships(part.relationships()?, "      ");
        }
    }

    if let Some(props) = package.core_properties() {
        println!("\nCore Properties:");
        if let Some(title) = &props.title {
            println!("   Title: {title}");
        }
        if let Some(creator) = &props.creator {
            println!("   Creator: {creator}");
        }
        if let Some(modified) = &props.modified {
            println!("   Modified: {modified}");
        }
    }

    println!("\nInflated {} bytes", package.inflated_bytes());
    package.revert();
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match inspect(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(exit_code(e.category()))
        },
    }
}
