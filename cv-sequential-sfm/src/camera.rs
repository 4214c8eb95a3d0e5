use cv_core::nalgebra::{Point2, Point3, Unit, Vector2, Vector3};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Focal length guess, as a multiple of the largest image side, for cameras without calibration.
const UNKNOWN_FOCAL_RATIO: f64 = 1.2;

/// Iterations used to invert the three coefficient radial model.
const DISTORT_ITERATIONS: usize = 20;

/// The projection model of an intrinsics group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum CameraModelKind {
    /// No model was declared. Replaced by the configured default before reconstruction.
    Unknown,
    /// Ideal pinhole with no distortion.
    Pinhole,
    /// Pinhole with one radial coefficient (K1).
    RadialK1,
    /// Pinhole with three radial coefficients (K1, K2, K3).
    RadialK3,
}

impl Default for CameraModelKind {
    fn default() -> Self {
        CameraModelKind::RadialK3
    }
}

/// Intrinsic parameters shared by every view captured with the same camera.
///
/// Distortion uses the division model of [`cv-pinhole`](https://docs.rs/cv-pinhole): the undistorted
/// normalized coordinate is the distorted one divided by `1 + k1 r^2 + k2 r^4 + k3 r^6`, where `r` is
/// the distorted radius.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Intrinsics {
    pub model: CameraModelKind,
    /// Focal length in pixels.
    pub focal: f64,
    pub principal_point: Point2<f64>,
    /// Radial coefficients. Only the ones used by `model` are read.
    pub distortion: [f64; 3],
    /// A locked group is never refined by bundle adjustment.
    pub locked: bool,
    /// False while the parameters are a guess rather than a calibration.
    pub initialized: bool,
}

impl Intrinsics {
    /// Creates calibrated intrinsics without distortion.
    pub fn new(model: CameraModelKind, focal: f64, principal_point: Point2<f64>) -> Self {
        Self {
            model,
            focal,
            principal_point,
            distortion: [0.0; 3],
            locked: false,
            initialized: model != CameraModelKind::Unknown,
        }
    }

    /// Creates a guess for a camera about which nothing but the image size is known.
    pub fn unknown(width: u32, height: u32) -> Self {
        let focal = UNKNOWN_FOCAL_RATIO * f64::from(width.max(height));
        Self {
            model: CameraModelKind::Unknown,
            focal,
            principal_point: Point2::new(f64::from(width) / 2.0, f64::from(height) / 2.0),
            distortion: [0.0; 3],
            locked: false,
            initialized: false,
        }
    }

    pub fn distortion(self, distortion: [f64; 3]) -> Self {
        Self { distortion, ..self }
    }

    pub fn locked(self, locked: bool) -> Self {
        Self { locked, ..self }
    }

    /// Replaces an unknown model with `default`, keeping the parameter guess.
    pub fn resolve_model(&mut self, default: CameraModelKind) {
        if self.model == CameraModelKind::Unknown {
            self.model = match default {
                CameraModelKind::Unknown => CameraModelKind::Pinhole,
                other => other,
            };
        }
    }

    fn radial_factor(&self, r2: f64) -> f64 {
        let [k1, k2, k3] = self.distortion;
        match self.model {
            CameraModelKind::Unknown | CameraModelKind::Pinhole => 1.0,
            CameraModelKind::RadialK1 => 1.0 + k1 * r2,
            CameraModelKind::RadialK3 => 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3)),
        }
    }

    /// Converts a pixel coordinate into a unit bearing in the camera frame.
    pub fn calibrate(&self, pixel: Point2<f64>) -> Unit<Vector3<f64>> {
        let distorted: Vector2<f64> = (pixel - self.principal_point) / self.focal;
        let undistorted = distorted / self.radial_factor(distorted.norm_squared());
        Unit::new_normalize(Vector3::new(undistorted.x, undistorted.y, 1.0))
    }

    /// Projects a point in the camera frame to pixels.
    ///
    /// Returns `None` for points on or behind the image plane.
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= 0.0 {
            return None;
        }
        let undistorted = point.coords.xy() / point.z;
        let distorted = self.distort(undistorted)?;
        Some(self.principal_point + distorted * self.focal)
    }

    fn distort(&self, undistorted: Vector2<f64>) -> Option<Vector2<f64>> {
        let u2 = undistorted.norm_squared();
        let k1 = self.distortion[0];
        match self.model {
            CameraModelKind::Unknown | CameraModelKind::Pinhole => Some(undistorted),
            CameraModelKind::RadialK1 if k1 == 0.0 || u2 == 0.0 => Some(undistorted),
            CameraModelKind::RadialK1 => {
                // Solving `d = u (1 + k1 |d|^2)` for `k1 |d|^2` is a quadratic in the undistorted radius.
                let discriminant = 1.0 - 4.0 * k1 * u2;
                if discriminant < 0.0 {
                    return None;
                }
                let r2_mul_k1 = -(2.0 * k1 * u2 + discriminant.sqrt() - 1.0) / (2.0 * k1 * u2);
                Some(undistorted * (1.0 + r2_mul_k1))
            }
            CameraModelKind::RadialK3 => {
                let mut distorted = undistorted;
                for _ in 0..DISTORT_ITERATIONS {
                    distorted = undistorted * self.radial_factor(distorted.norm_squared());
                }
                distorted.iter().all(|v| v.is_finite()).then(|| distorted)
            }
        }
    }
}
