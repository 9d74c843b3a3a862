//! Tit-for-tat unchoking.
//!
//! Every round the peers that sent us the most bytes are unchoked, plus one
//! random peer outside of them so newcomers get a chance to prove
//! themselves.

use rand::Rng;

use crate::peer::{ConnId, PeerSession};

/// What the choke round needs to know about a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: ConnId,
    /// Bytes received from the peer during the round that just ended.
    pub round_downloaded: u64,
    pub am_choking: bool,
    pub peer_interested: bool,
}

/// Pick the peers to unchoke among `candidates`, every other peer should be
/// choked.
///
/// The `slots` peers that sent us the most are unchoked. If some of them are
/// not interested, more peers are taken in rank order until `slots`
/// interested peers are unchoked. Finally one peer ranked below the first
/// `slots` is picked uniformly as the optimistic unchoke, which does nothing
/// if it was already picked.
///
/// Equal byte counts favour the peers we are not choking, so a round without
/// any traffic doesn't reshuffle the unchoked set.
pub fn unchoke_set<R: Rng + ?Sized>(
    candidates: &[Candidate],
    slots: usize,
    rng: &mut R,
) -> Vec<ConnId> {
    let mut ranked: Vec<&Candidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| {
        b.round_downloaded
            .cmp(&a.round_downloaded)
            .then(a.am_choking.cmp(&b.am_choking))
    });

    let mut unchoked: Vec<ConnId> = Vec::with_capacity(slots + 1);
    let mut interested = 0;

    for (rank, peer) in ranked.iter().enumerate() {
        if rank >= slots && interested >= slots {
            break;
        }
        if rank < slots || peer.peer_interested {
            unchoked.push(peer.id);
            if peer.peer_interested {
                interested += 1;
            }
        }
    }

    if ranked.len() > slots {
        let pick = ranked[rng.gen_range(slots..ranked.len())].id;
        if !unchoked.contains(&pick) {
            unchoked.push(pick);
        }
    }

    unchoked
}

/// Run a choke round over the connected sessions.
///
/// Sessions that finished the handshake are ranked by what they sent us
/// during the round. The picked ones are unchoked and every other one is
/// choked, including peers unchoked by a previous round. The round counters
/// of the ranked sessions start over. Returns the unchoked connections.
pub fn choke_round<R: Rng + ?Sized>(
    sessions: &mut [&mut PeerSession],
    slots: usize,
    rng: &mut R,
) -> Vec<ConnId> {
    let candidates: Vec<Candidate> = sessions
        .iter()
        .filter(|s| s.is_established())
        .map(|s| Candidate {
            id: s.id,
            round_downloaded: s.counter.round_downloaded,
            am_choking: s.state.am_choking,
            peer_interested: s.state.peer_interested,
        })
        .collect();

    let unchoked = unchoke_set(&candidates, slots, rng);

    for session in sessions.iter_mut().filter(|s| s.is_established()) {
        session.set_choke(!unchoked.contains(&session.id));
        session.counter.reset_round();
    }

    unchoked
}
