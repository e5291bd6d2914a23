//! The interactive channel to the person running kflash
//!
//! The pipeline never assumes a terminal. When no [Operator] is available,
//! as in batch runs, every question is answered "no": no retry, no override.

use crate::error::Error;

/// Someone who can answer questions while the pipeline runs
pub trait Operator {
    /// Ask a yes/no question. Interrupts and closed input are
    /// [Error::Cancelled].
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool, Error>;

    /// Show an instruction and wait until the operator acknowledges it
    fn acknowledge(&self, prompt: &str) -> Result<(), Error>;

    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Ask `operator` if there is one; answer `false` otherwise
pub fn confirm(operator: Option<&dyn Operator>, prompt: &str, default: bool) -> Result<bool, Error> {
    match operator {
        Some(operator) => operator.confirm(prompt, default),
        None => Ok(false),
    }
}
