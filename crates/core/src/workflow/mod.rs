pub mod dag;
pub mod executor;
pub mod runner;
pub mod step_executor;
pub mod validator;

pub use dag::{Dag, Frontier};
pub use executor::{PipelineExecutor, PipelineOutcome, PipelineReport};
pub use runner::{RunOutcome, Runner, ShellRunner};
pub use step_executor::StepExecutor;
pub use validator::{is_dag, topological_order, Rejection, Validator};
