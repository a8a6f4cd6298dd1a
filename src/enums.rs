use std::fmt;

/// Which pool a sampled volume belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Destination,
    Target,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Source => "source",
            Role::Destination => "destination",
            Role::Target => "target",
        };
        f.write_str(name)
    }
}

/// Fan-out/fan-in stages of an augmentation run, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    PreSlice,
    Prepare,
    Extract,
    Register,
    Apply,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::PreSlice => "pre-slice",
            Stage::Prepare => "prepare",
            Stage::Extract => "extract",
            Stage::Register => "register",
            Stage::Apply => "apply",
        };
        f.write_str(name)
    }
}

/// Interpolation passed to the external resampling tools.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interpolation {
    #[default]
    NearestNeighbor,
    Linear,
    BSpline(u8),
}

impl Interpolation {
    /// Spelling understood by the ANTs command line.
    pub fn ants_name(&self) -> String {
        match self {
            Interpolation::NearestNeighbor => "NearestNeighbor".to_string(),
            Interpolation::Linear => "Linear".to_string(),
            Interpolation::BSpline(order) => format!("BSpline[{order}]"),
        }
    }
}
