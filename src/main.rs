use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time;

use clap::Parser;
use log::info;

use mzaccess::io::MassSpectrometryFormat;
use mzaccess::{open_data_file, FilterConfig, LoadOptions, ScanRecord, Tolerance};

/// Load a mass spectrometry data file and describe what it contains
#[derive(clap::Parser)]
struct App {
    #[arg()]
    filename: PathBuf,

    /// Keep at most this many peaks in each window
    #[arg(short = 'n', long)]
    top_n: Option<usize>,

    /// The number of equal-width windows to filter peaks within
    #[arg(short, long)]
    windows: Option<usize>,

    /// Also filter MS1 scans
    #[arg(long, default_value_t = false)]
    filter_ms1: bool,

    /// The number of decoding threads, 0 for one per core
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,

    /// Extract an MS1 ion chromatogram at this m/z
    #[arg(short, long)]
    xic: Option<f64>,

    /// The XIC tolerance in PPM
    #[arg(long, default_value_t = 10.0)]
    ppm: f64,

    /// Recompute selected ion intensities from the precursor scans
    #[arg(short, long, default_value_t = false)]
    refine: bool,

    /// Write the loaded scans to this mzML file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Default)]
struct Summary {
    start_time: Option<f64>,
    end_time: Option<f64>,
    level_table: BTreeMap<u8, usize>,
    peak_table: BTreeMap<u8, usize>,
    linked: usize,
    unlinked: usize,
}

impl Summary {
    fn handle_scan(&mut self, scan: &ScanRecord) {
        let time = scan.retention_time();
        if !time.is_nan() {
            self.start_time = Some(self.start_time.map_or(time, |t| t.min(time)));
            self.end_time = Some(self.end_time.map_or(time, |t| t.max(time)));
        }
        let level = scan.ms_order();
        *self.level_table.entry(level).or_default() += 1;
        *self.peak_table.entry(level).or_default() += scan.spectrum().size();
        if level > 1 {
            if scan.one_based_precursor_scan_number().is_some() {
                self.linked += 1;
            } else {
                self.unlinked += 1;
            }
        }
    }

    fn write_out(&self) {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            println!("Retention time: {start:0.3}-{end:0.3} minutes");
        }
        println!("MS Levels:");
        for (level, count) in self.level_table.iter() {
            let peaks = self.peak_table.get(level).copied().unwrap_or_default();
            println!("\tMS{level}: {count} scans, {peaks} peaks");
        }
        if self.linked + self.unlinked > 0 {
            println!(
                "Precursor links: {} resolved, {} unresolved",
                self.linked, self.unlinked
            );
        }
    }
}

fn main() -> io::Result<()> {
    env_logger::init();
    let args = App::parse();

    let format = mzaccess::io::infer_format(&args.filename)?;
    if format == MassSpectrometryFormat::Unknown {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("Could not infer the format of {}", args.filename.display()),
        ));
    }

    let mut options = LoadOptions::new().with_max_threads(args.threads);
    if args.top_n.is_some() || args.windows.is_some() {
        let mut filter = FilterConfig::new().with_ms_orders(args.filter_ms1, true);
        if let Some(top_n) = args.top_n {
            filter = filter.with_peaks_per_window(top_n);
        }
        if let Some(windows) = args.windows {
            filter = filter.with_number_of_windows(windows);
        }
        options = options.with_filter(filter);
    }

    let start = time::Instant::now();
    let mut file = open_data_file(&args.filename)?;
    file.load_all_static_data(&options)?;
    info!(
        "Loaded {} scans in {:0.3} seconds",
        file.num_spectra()?,
        start.elapsed().as_secs_f64()
    );

    if args.refine {
        file.refine_selected_ions()?;
    }

    let mut summary = Summary::default();
    for scan in file.get_all_scans()? {
        summary.handle_scan(scan);
    }
    if let Some(source) = file.source_file() {
        println!("Source: {} ({:?})", source.name, source.file_format);
    }
    summary.write_out();

    if let Some(mz) = args.xic {
        println!("XIC at {mz} m/z:");
        for (time, intensity) in file.extract_ion_chromatogram(mz, Tolerance::PPM(args.ppm), 1)? {
            println!("{time}\t{intensity}");
        }
    }

    if let Some(output) = args.output.as_ref() {
        file.write_mzml(output, Default::default())?;
        info!("Wrote {}", output.display());
    }
    Ok(())
}
