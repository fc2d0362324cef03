/// Number of landmarks the handpose estimator emits per hand.
pub const NUM_LANDMARKS: usize = 21;

/// Length of a flattened landmark feature vector (21 points x xyz).
pub const FEATURE_LEN: usize = NUM_LANDMARKS * 3;

/// Wrist landmark, used as the translation origin.
pub const WRIST: usize = 0;

/// Middle-finger MCP joint, the reference point for scale.
pub const MIDDLE_MCP: usize = 9;

/// A packed RGB8 image handed from a frame source to the detector.
#[derive(Clone, Debug)]
pub struct Frame {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn expected_len(&self) -> usize {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(3)
    }
}

/// One detected hand: 21 points in normalized image coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct HandLandmarks {
    pub points: [[f32; 3]; NUM_LANDMARKS],
    pub confidence: f32,
    /// Handedness score from the estimator, >= 0.5 means right hand.
    pub handedness: f32,
}

impl HandLandmarks {
    pub fn from_points(points: [[f32; 3]; NUM_LANDMARKS]) -> Self {
        Self {
            points,
            confidence: 1.0,
            handedness: 0.0,
        }
    }

    /// Flatten into the raw feature layout `[x0, y0, z0, x1, ...]`.
    pub fn to_feature_vector(&self) -> [f32; FEATURE_LEN] {
        let mut out = [0.0; FEATURE_LEN];
        for (i, p) in self.points.iter().enumerate() {
            out[i * 3..i * 3 + 3].copy_from_slice(p);
        }
        out
    }
}
