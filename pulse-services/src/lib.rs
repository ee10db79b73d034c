pub mod conversations;
pub mod media;
pub mod messages;
pub mod users;

pub use conversations::ConversationService;
pub use media::MediaService;
pub use messages::MessageService;
pub use users::UserService;
