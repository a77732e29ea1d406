//! Tagged-sum record shapes shared by both wire forms (spec §4.3, §9
//! REDESIGN FLAGS).

#[derive(Debug, Clone, Default)]
pub struct Party {
    pub eq_type: u32,
    pub number: String,
    pub name: String,
    pub id: String,
    /// `PartyA`'s direction hint: `I` inbound, `O` outbound, empty otherwise.
    pub direction_hint: String,
}

#[derive(Debug, Clone, Default)]
pub struct Detail {
    pub call_id: String,
    pub state_code: u32,
    pub stamp: i64,
    pub conn_stamp: i64,
    pub end_stamp: i64,
    pub account_code: String,
    pub party_a: Party,
    pub party_b: Party,
    pub targets: Vec<Party>,
}

#[derive(Debug, Clone, Default)]
pub struct CallLost {
    pub call_id: String,
    pub cause: u32,
    pub stamp: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LinkLost {
    pub stamp: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct AttemptReject {
    pub call_id: String,
    pub target: String,
    pub cause: u32,
    pub stamp: i64,
}

#[derive(Debug, Clone)]
pub enum Record {
    Detail(Detail),
    CallLost(CallLost),
    LinkLost(LinkLost),
    AttemptReject(AttemptReject),
}
