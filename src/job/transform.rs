//! Pre-transform matrix generation.
//!
//! Clients send an initial orientation as three Euler angles (radians). When
//! the rotation is not the identity, it is written as an ITK affine transform
//! file that the worker image uses to initialise the registration.

use std::fmt::Write as _;
use std::path::Path;

use serde::Deserialize;

use crate::error::JobError;

/// File name of the generated pre-transform inside the job directory.
pub const PRE_TRANSFORM_FILE: &str = "initialTransform.tfm";

type Mat3 = [[f64; 3]; 3];

/// Parameters sent along with the uploaded volume.
#[derive(Debug, Clone, Deserialize)]
pub struct RotationParams {
    pub rotation: Vec<f64>,
}

impl RotationParams {
    pub fn parse(json: &str) -> Result<Self, JobError> {
        let params: Self = serde_json::from_str(json)
            .map_err(|e| JobError::InvalidParams(format!("malformed params: {}", e)))?;
        if params.rotation.len() != 3 {
            return Err(JobError::InvalidParams(format!(
                "rotation needs exactly 3 angles, got {}",
                params.rotation.len()
            )));
        }
        Ok(params)
    }

    fn angles(&self) -> (f64, f64, f64) {
        (self.rotation[0], self.rotation[1], self.rotation[2])
    }

    pub fn is_identity(&self) -> bool {
        self.rotation.iter().all(|a| *a == 0.0)
    }

    /// `Rx(x) * Ry(y) * Rz(z)`
    pub fn matrix(&self) -> Mat3 {
        let (x, y, z) = self.angles();
        mul(mul(rot_x(x), rot_y(y)), rot_z(z))
    }
}

/// Render a rotation as an ITK `AffineTransform_double_3_3` file.
pub fn render_itk(m: &Mat3) -> String {
    let mut out = String::from("Transform: AffineTransform_double_3_3\nParameters:");
    for row in m {
        for value in row {
            let _ = write!(out, " {:.6}", value);
        }
        out.push(' ');
    }
    // translation, then the rotation centre
    out.push_str(" 0 0 0\n");
    out.push_str("FixedParameters: 0 0 0\n");
    out
}

/// Write the pre-transform for `params_json` into `dir`.
///
/// Returns the file name to record in the job config, or `None` for a null
/// rotation (nothing is written).
pub async fn write_pre_transform(
    params_json: &str,
    dir: &Path,
) -> Result<Option<String>, JobError> {
    let params = RotationParams::parse(params_json)?;
    if params.is_identity() {
        tracing::debug!("Null rotation, skipping pre-transform");
        return Ok(None);
    }

    let contents = render_itk(&params.matrix());
    tokio::fs::write(dir.join(PRE_TRANSFORM_FILE), contents)
        .await
        .map_err(|e| JobError::Workspace {
            reason: format!("failed to write pre-transform: {}", e),
        })?;
    Ok(Some(PRE_TRANSFORM_FILE.to_string()))
}

fn rot_x(a: f64) -> Mat3 {
    let (s, c) = a.sin_cos();
    [[1.0, 0.0, 0.0], [0.0, c, -s], [0.0, s, c]]
}

fn rot_y(a: f64) -> Mat3 {
    let (s, c) = a.sin_cos();
    [[c, 0.0, s], [0.0, 1.0, 0.0], [-s, 0.0, c]]
}

fn rot_z(a: f64) -> Mat3 {
    let (s, c) = a.sin_cos();
    [[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]]
}

fn mul(a: Mat3, b: Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[r][k] * b[k][c]).sum();
        }
    }
    out
}
