//! 批处理结果.

use bl_frame::pipeline::{PipelineResult, SubjectOutcome};
use std::io::{self, Write};

/// 将单只小鼠的结果写进 `w` 中.
fn describe_into<W: Write>(id: &str, r: &PipelineResult<SubjectOutcome>, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    let o = match r {
        Ok(o) => o,
        Err(e) => return write!(w, "Mouse `{id}` failed: {e}"),
    };
    writeln!(w, "Mouse `{id}`:")?;
    if let Some(report) = &o.landmarks {
        writeln!(
            w,
            "{S4}Landmarks: bregma {:?}, lambda {:?}",
            report.bregma, report.lambda
        )?;
        writeln!(
            w,
            "{S4}Midline deviation: bregma {:.3} mm, lambda {:.3} mm, angle {:.2}°",
            report.deviation.bregma_mm, report.deviation.lambda_mm, report.deviation.angle_deg
        )?;
        for a in report.anomalies.iter() {
            writeln!(w, "{S4}Anomaly: {a}")?;
        }
    }
    writeln!(w, "{S4}Aligned: bregma {:?}, lambda {:?}", o.bregma, o.lambda)?;
    for (stage, s) in o.separations.iter() {
        writeln!(
            w,
            "{S4}Separation {stage}: left {:.2}%, right {:.2}%",
            s.left, s.right
        )?;
    }
    writeln!(
        w,
        "{S4}Segments: {} ({} failed)",
        o.table.len(),
        o.table.failures().count()
    )?;
    write!(w, "{S4}Saved to {}", o.path.display())
}

/// 批处理最终结果.
pub struct BatchResult {
    data: Vec<(String, PipelineResult<SubjectOutcome>)>,
}

impl BatchResult {
    pub fn from_iter<I: IntoIterator<Item = (String, PipelineResult<SubjectOutcome>)>>(
        it: I,
    ) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 是否所有小鼠都处理成功?
    pub fn all_succeeded(&self) -> bool {
        self.data.iter().all(|(_, r)| r.is_ok())
    }

    /// 输出运行结果.
    pub fn analyze(&self) {
        utils::sep();
        let mut buf = Vec::with_capacity(512);

        for (id, r) in self.data.iter() {
            if describe_into(id, r, &mut buf).is_ok() {
                println!("{}", String::from_utf8_lossy(&buf));
            }
            buf.clear();

            utils::sep();
        }
    }
}
