/// Where a single close attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseState {
    /// waiting for the replicas to be synchronized
    Pending,
    Closing { outstanding: usize, confirmed: usize },
    /// at least one replica closed the file, its metadata is gone
    Closed,
    /// synchronizing failed, the metadata was removed without a close
    Abandoned,
    /// no replica confirmed the close, the metadata is kept
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseEvent {
    /// replicas are in sync, `dispatched` closes were sent out
    Synced { dispatched: usize },
    SyncFailed,
    ReplicaClosed,
    /// the replica answered but did not close the file
    ReplicaRejected,
    /// no answer, or the request failed on the way
    ReplicaFailed,
}

impl CloseState {
    pub fn on(self, event: CloseEvent) -> Self {
        use CloseEvent as E;

        match (self, event) {
            (Self::Pending, E::Synced { dispatched: 0 }) => Self::Failed,
            (Self::Pending, E::Synced { dispatched }) => Self::Closing {
                outstanding: dispatched,
                confirmed: 0,
            },
            (Self::Pending, E::SyncFailed) => Self::Abandoned,
            (
                Self::Closing {
                    outstanding,
                    confirmed,
                },
                E::ReplicaClosed | E::ReplicaRejected | E::ReplicaFailed,
            ) => {
                let confirmed = confirmed + usize::from(event == E::ReplicaClosed);
                match outstanding.saturating_sub(1) {
                    0 if confirmed > 0 => Self::Closed,
                    0 => Self::Failed,
                    outstanding => Self::Closing {
                        outstanding,
                        confirmed,
                    },
                }
            }
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Abandoned | Self::Failed)
    }
}
