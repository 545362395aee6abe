//! 任务概要.

use spect_berry::task::Task;
use std::io::{self, Write};
use std::path::Path;

/// 将 `task` 的参数与数据概要写进 `w` 中.
pub fn describe_into<W: Write>(path: &Path, task: &Task, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    #[inline]
    fn path_to_display(p: &Path) -> String {
        if p.as_os_str().is_empty() {
            "/".to_string()
        } else {
            p.display().to_string()
        }
    }

    let p = task.parameter();
    writeln!(w, "Task `{}` ({}):", task.name(), path.display())?;
    writeln!(w, "{S4}System matrix: {}", path_to_display(&p.sysmat_path))?;
    writeln!(w, "{S4}Input: {}", path_to_display(&p.sinogram_path))?;
    writeln!(w, "{S4}Format: {} ({})", p.file_format, p.data_type)?;
    writeln!(w, "{S4}Attenuation map: {}", path_to_display(&p.mumap_path))?;
    writeln!(
        w,
        "{S4}Scatter map: {} (in use: {})",
        path_to_display(&p.scatter_map_path),
        p.use_scatter_map
    )?;
    writeln!(
        w,
        "{S4}Restoration model: {} (in use: {})",
        path_to_display(&p.model_path),
        p.use_nn
    )?;
    writeln!(w, "{S4}Output directory: {}", p.resolved_output_dir().display())?;
    writeln!(
        w,
        "{S4}Iterator: {}, {} iterations, {} dual iterations, checkpoint every {}",
        p.iterator, p.num_iters, p.num_dual_iters, p.checkpoint_stride
    )?;
    writeln!(
        w,
        "{S4}Lambda: {:.6}, gamma: {:.6}, scatter coefficient: {:.6}",
        p.lambda, p.gamma, p.coeff_scatter
    )?;
    let g = p.geometry();
    writeln!(
        w,
        "{S4}Geometry (S, A, D): ({}, {}, {})",
        g.num_slices, g.num_angles, g.num_detectors
    )?;
    if p.is_loaded() {
        writeln!(
            w,
            "{S4}Cursor: slice {}, angle {}",
            p.index_sinogram(),
            p.index_projection()
        )?;
        for line in p.sinogram_info().report().lines() {
            writeln!(w, "{S4}{S4}{line}")?;
        }
    } else {
        writeln!(w, "{S4}No data loaded")?;
    }
    let results = task.results();
    match results.last() {
        Some(last) => write!(
            w,
            "{S4}{} result(s) at {}x{}, final at iteration {}",
            results.len(),
            p.resolution,
            p.resolution,
            last.iteration
        )?,
        None => write!(w, "{S4}No results")?,
    }
    writeln!(w)
}
