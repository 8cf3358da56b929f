pub mod character;
pub mod foreshadow;

pub use character::{CharacterStateIndex, CharacterStateRow};
pub use foreshadow::{ForeshadowIndex, ForeshadowPriority, ForeshadowRow, ForeshadowStatus};
