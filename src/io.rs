use anyhow::Result;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::driver::IterationSummary;
use crate::recorder::Metric;

pub struct CsvWriter {
    w: BufWriter<File>,
}

impl CsvWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let f = File::create(path)?;
        Ok(Self { w: BufWriter::new(f) })
    }

    pub fn write_history_header(&mut self) -> Result<()> {
        writeln!(
            self.w,
            "iteration,objective,power,mean_T,volume,max_change,do_turb_adj_solve,turb_adj_solves,turb_adj_reused,converged,elapsed_s"
        )?;
        Ok(())
    }

    pub fn write_history_row(&mut self, row: &IterationSummary) -> Result<()> {
        writeln!(
            self.w,
            "{},{:.10e},{:.6e},{:.6e},{:.6},{:.6e},{},{},{},{},{:.3}",
            row.iteration,
            row.objective,
            row.component("power").unwrap_or(f64::NAN),
            row.component("mean_T").unwrap_or(f64::NAN),
            row.component("volume").unwrap_or(f64::NAN),
            row.max_change,
            row.do_turb_adj_solve,
            row.passes.turbulence_solves,
            row.passes.turbulence_reused(),
            row.converged,
            row.elapsed_s
        )?;
        Ok(())
    }

    pub fn write_metric_header(&mut self) -> Result<()> {
        writeln!(self.w, "iteration,elapsed_s,category,name,value")?;
        Ok(())
    }

    pub fn write_metric_row(&mut self, m: &Metric) -> Result<()> {
        writeln!(
            self.w,
            "{},{:.3},{},{},{:.10e}",
            m.iteration, m.elapsed_s, m.category, m.name, m.value
        )?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}
