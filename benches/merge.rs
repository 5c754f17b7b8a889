use criterion::{black_box, criterion_group, criterion_main, Criterion};

use mzaccess::tof::{merge_arrays_to_spectrum, merge_spectra};
use mzaccess::{FilterConfig, MzLookupTable, Spectrum, TofMergeConfig, TofRawFrame, Tolerance};

const TABLE_SIZE: u32 = 400_000;

/// A cheap deterministic sequence so runs are comparable
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }
}

fn make_frames(n_frames: usize, peaks_per_frame: usize) -> Vec<TofRawFrame> {
    let mut rng = Lcg(42);
    (0..n_frames)
        .map(|_| {
            let mut indices: Vec<u32> = (0..peaks_per_frame)
                .map(|_| rng.next() % TABLE_SIZE)
                .collect();
            indices.sort_unstable();
            indices.dedup();
            let intensities = indices.iter().map(|_| 1 + rng.next() % 500).collect();
            TofRawFrame::new(indices, intensities).unwrap()
        })
        .collect()
}

fn make_spectra(n_spectra: usize, size: usize) -> Vec<Spectrum> {
    let mut rng = Lcg(7);
    (0..n_spectra)
        .map(|_| {
            let mut mzs: Vec<f64> = (0..size)
                .map(|_| 100.0 + (rng.next() % 1_900_000) as f64 / 1000.0)
                .collect();
            mzs.sort_by(|a, b| a.total_cmp(b));
            let intensities = mzs.iter().map(|_| (rng.next() % 10_000) as f64).collect();
            Spectrum::new(mzs, intensities).unwrap()
        })
        .collect()
}

fn tof_merging(c: &mut Criterion) {
    let table =
        MzLookupTable::from_calibration(TABLE_SIZE, |i| (100.0f64.sqrt() + i as f64 * 1e-4).powi(2))
            .unwrap();
    let frames = make_frames(50, 2000);
    let config = TofMergeConfig::default();
    c.bench_function("merge_tof_frames", |b| {
        b.iter(|| merge_arrays_to_spectrum(black_box(&frames), &table, &config).unwrap())
    });

    let spectra = make_spectra(20, 3000);
    c.bench_function("merge_spectra", |b| {
        b.iter(|| merge_spectra(black_box(&spectra), Tolerance::PPM(10.0)))
    });
}

fn peak_filtering(c: &mut Criterion) {
    let spectrum = make_spectra(1, 20_000).pop().unwrap();
    let top_n = FilterConfig::new().with_peaks_per_window(200);
    let windowed = FilterConfig::new()
        .with_peaks_per_window(20)
        .with_number_of_windows(10)
        .with_normalization(true);
    c.bench_function("filter_top_n", |b| {
        b.iter(|| black_box(&spectrum).filtered(&top_n))
    });
    c.bench_function("filter_windowed", |b| {
        b.iter(|| black_box(&spectrum).filtered(&windowed))
    });
}

criterion_group!(benches, tof_merging, peak_filtering);
criterion_main!(benches);
