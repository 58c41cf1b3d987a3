pub mod config;
pub mod error;
pub mod injection;
pub mod persistence;
pub mod plan;
pub mod record;
pub mod rng;
pub mod victim;

pub mod prelude {
    pub use crate::config::{Args, Config};
    pub use crate::error::{ErrorClass, FaultError};
    pub use crate::injection::host::{InlineHost, Instrumentation, OperandAccess};
    pub use crate::injection::instrument::{InstrumentedInstruction, Instrumenter, StaticInstruction};
    pub use crate::injection::operand::{EligibilityFilter, Operand, OperandKind};
    pub use crate::injection::selector::Phase;
    pub use crate::injection::{
        BlockAction, DetachPolicy, FinalReport, Granularity, Observation, Session, SessionConfig,
        Variant,
    };
    pub use crate::persistence::{FileNames, Mode, SessionFiles};
    pub use crate::plan::{plan_targets, write_plan};
    pub use crate::record::descriptor::{InjectionDescriptor, Scope, TargetDescriptor};
    pub use crate::record::profile::ProfileRecord;
    pub use crate::rng::Mt64;
    pub use crate::victim::{RankOutcome, RunOptions, Runner, VictimProgram};
}
