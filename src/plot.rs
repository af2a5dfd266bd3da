use crate::checkpoint::EpochLosses;
use crate::error::{PdeError, Result};
use plotters::prelude::*;
use std::path::Path;

/// log10 を取る前の下限
const LOG_FLOOR: f64 = 1.0e-12;

fn log10(value: f64) -> f64 {
    value.max(LOG_FLOOR).log10()
}

fn plot_err(e: impl std::fmt::Display) -> PdeError {
    PdeError::Plot(e.to_string())
}

/// 学習過程の損失をグラフとしてPNGファイルに出力します。
pub fn plot_loss_history(losses: &[EpochLosses], path: impl AsRef<Path>) -> Result<()> {
    let series: [(&str, RGBColor, fn(&EpochLosses) -> f64); 5] = [
        ("Loss", RED, |l| l.loss),
        ("Val Loss", MAGENTA, |l| l.val_loss),
        ("MSE", GREEN, |l| l.mse),
        ("Body Residual", BLUE, |l| l.res_body),
        ("Neumann Residual", CYAN, |l| l.res_neu),
    ];
    let (min_log, max_log) = losses
        .iter()
        .flat_map(|l| series.iter().map(move |(_, _, get)| log10(get(l))))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let (min_log, max_log) = if min_log.is_finite() && max_log.is_finite() {
        (min_log - 0.5, max_log + 0.5)
    } else {
        (-6.0, 0.0)
    };

    let root = BitMapBackend::new(path.as_ref(), (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Loss History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..losses.len().max(1), min_log..max_log)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .y_desc("Loss (log10 scale)")
        .x_desc("Epochs")
        .draw()
        .map_err(plot_err)?;
    for (label, color, get) in series {
        chart
            .draw_series(LineSeries::new(
                losses.iter().enumerate().map(|(i, l)| (i, log10(get(l)))),
                &color,
            ))
            .map_err(plot_err)?
            .label(label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

/// ベイズモデルの `Sigma2²` の推移。
pub fn plot_sigma2_history(var_sigma2: &[f64], path: impl AsRef<Path>) -> Result<()> {
    let max = var_sigma2.iter().copied().fold(0.0, f64::max).max(LOG_FLOOR);
    let root = BitMapBackend::new(path.as_ref(), (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Sigma2^2 History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0..var_sigma2.len().max(1), 0.0..max * 1.1)
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .y_desc("Sigma2^2")
        .x_desc("Epochs")
        .draw()
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(var_sigma2.iter().copied().enumerate(), &RED))
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}
