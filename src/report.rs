// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

use crate::{EnergyHistory, ExperimentResult, RunReport};
use anyhow::Context;
use itertools::{Itertools, MinMaxResult};
use nu_ansi_term::Color::{Green, Yellow};
use rgb::RGB8;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use textplots::{Chart, ColorPlot, Shape};

/// Write total energy per iteration to a plain text file
pub fn write_history(path: impl AsRef<Path>, history: &EnergyHistory) -> anyhow::Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("Cannot create {}", path.display()))?;
    let mut stream = BufWriter::new(file);
    writeln!(stream, "# iteration energy")?;
    for (iteration, energy) in history.energies().iter().enumerate() {
        writeln!(stream, "{} {:.8}", iteration, energy)?;
    }
    stream.flush()?;
    Ok(())
}

/// Write the energy history and its minimum as JSON
pub fn write_json(path: impl AsRef<Path>, result: &ExperimentResult) -> anyhow::Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("Cannot create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), result)
        .with_context(|| format!("Cannot write JSON to {}", path.display()))?;
    Ok(())
}

/// Log a summary of a run and plot its energy history to the terminal
pub fn report_run(report: &RunReport) {
    let history = &report.history;
    info!(
        "{} after {} iterations: {:.6} (last {:.6}); {} point(s) re-seeded",
        Green.bold().paint("Minimum energy"),
        history.len(),
        report.best_energy(),
        history.last().unwrap_or(f64::NAN),
        report.reseeded
    );
    plot_history(history);
}

/// Plot total energy against iteration; needs at least two iterations
pub fn plot_history(history: &EnergyHistory) {
    if history.len() < 2 || log::max_level() < log::Level::Info {
        return;
    }
    let data = history
        .energies()
        .iter()
        .enumerate()
        .map(|(iteration, energy)| (iteration as f32, *energy as f32))
        .collect_vec();
    if let MinMaxResult::MinMax(min, max) = data
        .iter()
        .map(|(_, energy)| *energy)
        .minmax_by(f32::total_cmp)
    {
        info!(
            "Plot: {} along iterations ({:.4} to {:.4})",
            Yellow.bold().paint("total energy"),
            min,
            max
        );
    }
    const YELLOW: RGB8 = RGB8::new(255, 255, 0);
    let xmax = (history.len() - 1) as f32;
    Chart::new(100, 50, 0.0, xmax)
        .linecolorplot(&Shape::Lines(&data), YELLOW)
        .nice();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> EnergyHistory {
        let mut history = EnergyHistory::default();
        for energy in [10.5, 8.25, 9.0] {
            history.push(energy);
        }
        history
    }

    #[test]
    fn test_write_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("energy.dat");
        write_history(&path, &history()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines = contents.lines().collect_vec();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "# iteration energy");
        assert_eq!(lines[2], "1 8.25000000");
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        let result = ExperimentResult {
            energies: history().energies().to_vec(),
            min_energy: 8.25,
        };
        write_json(&path, &result).unwrap();
        let json = std::fs::read_to_string(&path).unwrap();
        let parsed: ExperimentResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("energy.dat");
        assert!(write_history(&path, &history()).is_err());
    }

    #[test]
    fn test_plot_short_history() {
        // Nothing to draw, but must not panic
        plot_history(&EnergyHistory::default());
        let mut history = EnergyHistory::default();
        history.push(1.0);
        plot_history(&history);
    }
}
