pub mod envelope;
pub mod prekeys;
pub mod ratchet;
pub mod session;
pub mod skipped;
pub mod x3dh;

pub use envelope::{Envelope, PreKeyMessage, RatchetMessage};
pub use prekeys::{IdentityManager, OneTimePreKeyPublic, PreKeyBundle, PublicBundle, SignedPreKeyPublic};
pub use ratchet::{Direction, Header, Phase, RatchetEngine};
pub use session::{DeviceId, SessionId, SessionManager};
pub use x3dh::{Handshake, SessionEstablisher};
