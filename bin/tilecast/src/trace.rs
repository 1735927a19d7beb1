use anyhow::Context;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use tilecast::pose::HeadPose;

/// Head pose trace, one `pts,yaw,pitch` line per sample.
///
/// Empty lines and lines starting with `#` are skipped.
pub fn load_trace(path: &Path) -> anyhow::Result<Vec<HeadPose>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open pose trace {}", path.display()))?;

    let mut poses = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let pose = parse_line(line).with_context(|| format!("invalid pose at line {}", index + 1))?;
        poses.push(pose);
    }

    poses.sort_by_key(|p| p.pts);
    Ok(poses)
}

fn parse_line(line: &str) -> anyhow::Result<HeadPose> {
    let mut fields = line.split(',').map(str::trim);
    let (Some(pts), Some(yaw), Some(pitch)) = (fields.next(), fields.next(), fields.next()) else {
        anyhow::bail!("expected pts,yaw,pitch");
    };
    Ok(HeadPose::new(yaw.parse()?, pitch.parse()?, pts.parse()?))
}
