use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupParticipant {
    #[serde(rename = "JID")]
    pub jid: String,
    pub is_admin: bool,
    pub is_super_admin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupInfo {
    #[serde(rename = "JID")]
    pub jid: String,
    pub name: String,
    #[serde(rename = "OwnerJID")]
    pub owner_jid: Option<String>,
    pub participants: Vec<GroupParticipant>,
}

impl GroupInfo {
    pub fn admins(&self) -> impl Iterator<Item = &GroupParticipant> {
        self.participants
            .iter()
            .filter(|p| p.is_admin || p.is_super_admin)
    }
}
