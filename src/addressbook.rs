//! C9 glue — address book (spec §4.8 "Listener registrations"). Thin: owns
//! the set of contacts a user has added and the `(remote, local)` pairs
//! currently being listened for, and feeds that trust decision straight
//! into the pub/sub fabric's trust gate (spec §4.7 "populated by the
//! AddressBook's Listener registrations").

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::ident::Identifier;
use crate::pubsub::Fabric;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: Identifier,
    pub name: String,
}

/// Contacts a node's users have added, plus reference-counted
/// `register_listener`/`unregister_listener` pairs (spec §4.8). Listening a
/// `(remote, local)` pair is exactly what trusts it on the pub/sub fabric;
/// nothing else in the system is allowed to call [`Fabric::trust`] directly.
pub struct AddressBook {
    fabric: Arc<Fabric>,
    contacts: RwLock<HashMap<Identifier, Contact>>,
    listening: RwLock<HashMap<(Identifier, Identifier), u32>>,
}

impl AddressBook {
    pub fn new(fabric: Arc<Fabric>) -> Self {
        AddressBook { fabric, contacts: RwLock::new(HashMap::new()), listening: RwLock::new(HashMap::new()) }
    }

    pub async fn add_contact(&self, contact: Contact) {
        self.contacts.write().await.insert(contact.user_id, contact);
    }

    pub async fn remove_contact(&self, user_id: &Identifier) {
        self.contacts.write().await.remove(user_id);
    }

    pub async fn contacts(&self) -> Vec<Contact> {
        self.contacts.read().await.values().cloned().collect()
    }

    pub async fn is_contact(&self, user_id: &Identifier) -> bool {
        self.contacts.read().await.contains_key(user_id)
    }

    /// Register interest in the `(remote, local)` pair. The first
    /// registration trusts the pair on the fabric; later ones just bump a
    /// refcount so independent listeners don't fight over untrust ordering.
    pub async fn register_listener(&self, remote: Identifier, local: Identifier) {
        let became_trusted = {
            let mut listening = self.listening.write().await;
            let count = listening.entry((remote, local)).or_insert(0);
            *count += 1;
            *count == 1
        };
        if became_trusted {
            self.fabric.trust(remote, local).await;
        }
    }

    pub async fn unregister_listener(&self, remote: Identifier, local: Identifier) {
        let became_untrusted = {
            let mut listening = self.listening.write().await;
            match listening.get_mut(&(remote, local)) {
                Some(count) => {
                    *count -= 1;
                    let empty = *count == 0;
                    if empty {
                        listening.remove(&(remote, local));
                    }
                    empty
                }
                None => false,
            }
        };
        if became_untrusted {
            self.fabric.untrust(remote, local).await;
        }
    }

    pub async fn is_listening(&self, remote: Identifier, local: Identifier) -> bool {
        self.listening.read().await.contains_key(&(remote, local))
    }

    /// All currently listened pairs, used by the beacon loop (spec §4.8) to
    /// decide which identities to announce and which to look up.
    pub async fn listening_pairs(&self) -> Vec<(Identifier, Identifier)> {
        self.listening.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlockStore;

    fn id(b: u8) -> Identifier {
        Identifier([b; 32])
    }

    async fn book() -> AddressBook {
        let store = Arc::new(BlockStore::open_in_memory_for_tests().await.unwrap());
        let fabric = Arc::new(Fabric::new(store));
        AddressBook::new(fabric)
    }

    #[tokio::test]
    async fn register_listener_trusts_pair_on_fabric() {
        let book = book().await;
        assert!(!book.fabric.is_trusted(id(1), id(2)).await);
        book.register_listener(id(1), id(2)).await;
        assert!(book.fabric.is_trusted(id(1), id(2)).await);
    }

    #[tokio::test]
    async fn refcounted_listeners_untrust_only_after_last_unregister() {
        let book = book().await;
        book.register_listener(id(1), id(2)).await;
        book.register_listener(id(1), id(2)).await;
        book.unregister_listener(id(1), id(2)).await;
        assert!(book.fabric.is_trusted(id(1), id(2)).await);
        book.unregister_listener(id(1), id(2)).await;
        assert!(!book.fabric.is_trusted(id(1), id(2)).await);
    }

    #[tokio::test]
    async fn contacts_add_remove_roundtrip() {
        let book = book().await;
        let contact = Contact { user_id: id(7), name: "alice".into() };
        book.add_contact(contact.clone()).await;
        assert!(book.is_contact(&id(7)).await);
        assert_eq!(book.contacts().await, vec![contact]);
        book.remove_contact(&id(7)).await;
        assert!(!book.is_contact(&id(7)).await);
    }
}
