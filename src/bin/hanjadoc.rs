//! CLI binary for hanjadoc.
//!
//! A thin shim over the library crate. Only the subcommands that need no
//! live VLM client are exposed here (inspect, render, the text-layer
//! strategy pre-check, and chapter conversion of an existing result),
//! because the vision primitive is supplied by the embedding application,
//! not this binary.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hanjadoc::chapter::{PageRangeMap, TocEntry};
use hanjadoc::pipeline::render::{PageRenderer, RenderOptions};
use hanjadoc::pipeline::sampler::precheck_text_layer;
use hanjadoc::pipeline::textlayer::PdfTextExtractor;
use hanjadoc::{chapters_from_output, AbortSignal, PipelineConfig};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "hanjadoc",
    version,
    about = "Structured OCR tooling for Korean archaeological reports"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Rasteriser executable.
    #[arg(long, global = true, default_value = "magick", env = "HANJADOC_RASTERIZER")]
    rasterizer: String,

    /// pdftotext executable.
    #[arg(long, global = true, default_value = "pdftotext", env = "HANJADOC_PDFTOTEXT")]
    pdftotext: String,

    /// pdfinfo executable.
    #[arg(long, global = true, default_value = "pdfinfo", env = "HANJADOC_PDFINFO")]
    pdfinfo: String,
}

#[derive(Subcommand)]
enum Command {
    /// Page count and per-page text-layer statistics.
    Inspect {
        /// Path to the PDF.
        pdf: PathBuf,
    },

    /// Rasterise every page into <out>/pages/page_<i>.png.
    Render {
        /// Path to the PDF.
        pdf: PathBuf,
        /// Output directory.
        #[arg(short, long, default_value = "output")]
        out: PathBuf,
        /// Rendering DPI.
        #[arg(long, default_value_t = 300)]
        dpi: u32,
    },

    /// Text-layer strategy pre-check (no VLM calls).
    Strategy {
        /// Path to the PDF.
        pdf: PathBuf,
    },

    /// Convert an extraction result against a TOC into chapters.
    Chapters {
        /// Directory containing result.json.
        output_dir: PathBuf,
        /// Path to the validated TOC JSON (array of entries).
        #[arg(long)]
        toc: PathBuf,
        /// Optional page-range map JSON for double-sided scans.
        #[arg(long)]
        page_map: Option<PathBuf>,
        /// Where to write the chapter tree.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::builder()
        .rasterizer_bin(&cli.rasterizer)
        .pdftotext_bin(&cli.pdftotext)
        .pdfinfo_bin(&cli.pdfinfo)
        .build()
        .context("invalid configuration")?;

    match cli.command {
        Command::Inspect { pdf } => inspect(&pdf, &config).await,
        Command::Render { pdf, out, dpi } => render(&pdf, &out, dpi, &config).await,
        Command::Strategy { pdf } => strategy(&pdf, &config).await,
        Command::Chapters {
            output_dir,
            toc,
            page_map,
            out,
        } => chapters(&output_dir, &toc, page_map.as_deref(), out.as_deref()).await,
    }
}

async fn inspect(pdf: &std::path::Path, config: &PipelineConfig) -> Result<()> {
    let extractor = PdfTextExtractor::new(&config.pdftotext_bin, &config.pdfinfo_bin);
    let pages = extractor.page_count(pdf).await;
    if pages == 0 {
        bail!("could not read page count (is pdfinfo installed and the file a PDF?)");
    }
    println!("{}: {} pages", pdf.display(), pages);

    let bar = ProgressBar::new(pages as u64);
    bar.set_style(
        ProgressStyle::with_template("[{bar:40.green/238}] {pos}/{len} pages")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut empty = 0usize;
    let mut with_cjk = 0usize;
    for page in 1..=pages {
        let text = extractor.extract_page_text(pdf, page).await;
        if text.trim().is_empty() {
            empty += 1;
        } else if text.chars().any(hanjadoc::pipeline::sampler::is_cjk) {
            with_cjk += 1;
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    println!("  text layer: {} empty, {} pages with CJK", empty, with_cjk);
    Ok(())
}

async fn render(
    pdf: &std::path::Path,
    out: &std::path::Path,
    dpi: u32,
    config: &PipelineConfig,
) -> Result<()> {
    let bar = spinner(&format!("Rasterising at {dpi} DPI…"));
    let renderer = PageRenderer::new(&config.rasterizer_bin);
    let rendered = renderer
        .render(pdf, out, RenderOptions { dpi })
        .await
        .context("rasterisation failed")?;
    bar.finish_and_clear();

    println!(
        "{} pages rendered into {}",
        rendered.page_count,
        rendered.pages_dir.display()
    );
    Ok(())
}

async fn strategy(pdf: &std::path::Path, config: &PipelineConfig) -> Result<()> {
    let decision = precheck_text_layer(pdf, config, &AbortSignal::new())
        .await
        .context("pre-check failed")?;

    match decision {
        Some(decision) => {
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        None => {
            bail!(
                "text layer is inconclusive; VLM sampling is required \
                 (run through the library with a vision client)"
            );
        }
    }
    Ok(())
}

async fn chapters(
    output_dir: &std::path::Path,
    toc_path: &std::path::Path,
    page_map: Option<&std::path::Path>,
    out: Option<&std::path::Path>,
) -> Result<()> {
    let toc_json = std::fs::read_to_string(toc_path)
        .with_context(|| format!("cannot read TOC '{}'", toc_path.display()))?;
    let toc: Vec<TocEntry> = serde_json::from_str(&toc_json).context("invalid TOC JSON")?;

    let page_range_map: PageRangeMap = match page_map {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read page map '{}'", path.display()))?;
            serde_json::from_str(&json).context("invalid page map JSON")?
        }
        None => PageRangeMap::new(),
    };

    let chapters = chapters_from_output(output_dir, &toc, &page_range_map).await?;
    let json = serde_json::to_string_pretty(&chapters)?;

    match out {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("cannot write '{}'", path.display()))?;
            println!("wrote {} chapters to {}", chapters.len(), path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
