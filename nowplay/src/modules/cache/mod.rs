//! Cache modules: keyed stores of songs still owed to some outputs.

use crate::Error;

pub mod memory;

pub(crate) fn register_builtins() -> Result<(), Error> {
    memory::register_memory()
}
