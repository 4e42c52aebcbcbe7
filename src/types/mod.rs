pub mod event;
pub mod room;
pub mod tuples;
pub mod user_profile;
pub mod version_map;

pub use event::{Event, EventHash, PartialEvent, REL_ANNOTATION, REL_THREAD};
pub use room::Room;
pub use tuples::{
    sort_event_id_tups, value_for_event_id_tup, value_for_membership_tup,
    value_for_state_tup_with_id, value_for_versionstamp, value_to_event_id_tup,
    value_to_membership_tup, value_to_state_tup_with_id, value_to_versionstamp, EventIdTup,
    EventIdTupWithVersion, MembershipChanges, Memberships, MembershipTup, MembershipTupWithVersion,
    StateMap, StateTup, StateTupWithId,
};
pub use user_profile::UserProfile;
pub use version_map::{VersionMap, ACCOUNTS_STREAM, DEVICES_STREAM, ROOMS_STREAM};
