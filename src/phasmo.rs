//! Phasmophobia memory map and the walkie-talkie fix.
//!
//! The structure this module navigates (with the obfuscation removed):
//!
//! ```text
//! public class Network : MonoBehaviourPunCallbacks {
//!     public class PlayerSpot {
//!         public Player player;
//!         public string accountName;
//!     }
//!     private static Network _instance;
//!     public Player localPlayer;
//!     public List<Network.PlayerSpot> playersData;
//! }
//! public class Player      : MonoBehaviour { public PlayerAudio playerAudio; }
//! public class PlayerAudio : MonoBehaviour { public WalkieTalkie walkieTalkie; }
//! public class WalkieTalkie : MonoBehaviour {
//!     public bool isOn;
//!     private bool isGhostSpawned;
//! }
//! ```
//!
//! Only the class anchors are cached across runs. Field offsets are
//! re-derived every time: validating a cached field offset costs about the
//! same as finding it again, so persisting them buys nothing.

use std::path::PathBuf;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::il2cpp::structs::{CLASS_STATIC_FIELDS, FIELD_ACCESS_MASK, FIELD_ACCESS_PRIVATE};
use crate::il2cpp::{Il2CppId, Il2CppReader, TypeCode, MAX_CLASS_FIELDS};
use crate::remote::{MemorySource, RemotePtr};
use crate::resolver::{resolve_class_anchors, ClassAnchor, OffsetCache};

pub const PHASMO_EXE_NAME: &str = "Phasmophobia.exe";

/// Lobby size cap; a longer players list means misread memory.
pub const MAX_PLAYERS: usize = 4;

const CACHE_FILE_NAME: &str = "phasmo_vc_fixer.cache";

const NETWORK: Il2CppId<'static> = Il2CppId::new("Network", "");
const PLAYER_SPOT: Il2CppId<'static> = Il2CppId::new("PlayerSpot", "");
const PLAYER: Il2CppId<'static> = Il2CppId::new("Player", "");
const PLAYER_AUDIO: Il2CppId<'static> = Il2CppId::new("PlayerAudio", "");
const WALKIE_TALKIE: Il2CppId<'static> = Il2CppId::new("WalkieTalkie", "");
const LIST_1: Il2CppId<'static> = Il2CppId::new("List`1", "System.Collections.Generic");

/// What to write into the remote players' `isGhostSpawned` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkieTalkieFix {
    /// Force the flag off (demonstration).
    ForceOff,
    /// Force the flag on (demonstration).
    ForceOn,
    /// Synchronize the remote flags with the local player's.
    #[default]
    Auto,
}

/// Everything init() resolves from the live process.
struct GameOffsets {
    inst_network: RemotePtr,
    fld_network_local_player: u64,
    fld_network_players_data: u64,
    fld_player_player_audio: u64,
    fld_player_audio_walkie_talkie: u64,
    fld_walkie_talkie_is_ghost_spawned: u64,
    fld_player_spot_player: u64,
    fld_player_spot_account_name: u64,
}

pub struct PhasmoMemory {
    reader: Option<Il2CppReader>,
    offsets: Option<GameOffsets>,
    cache: OffsetCache,
    load_cache: bool,
    save_cache: bool,
}

impl PhasmoMemory {
    pub fn new() -> Self {
        PhasmoMemory {
            reader: None,
            offsets: None,
            cache: OffsetCache::new(std::env::temp_dir().join(CACHE_FILE_NAME)),
            load_cache: true,
            save_cache: true,
        }
    }

    pub fn set_load_cache(&mut self, load: bool) {
        self.load_cache = load;
    }

    pub fn set_save_cache(&mut self, save: bool) {
        self.save_cache = save;
    }

    pub fn set_cache_path(&mut self, path: impl Into<PathBuf>) {
        self.cache = OffsetCache::new(path);
    }

    /// Attaches to a running Phasmophobia process.
    pub fn open(&mut self) -> Result<()> {
        self.close();
        self.reader = Some(Il2CppReader::open(PHASMO_EXE_NAME)?);
        Ok(())
    }

    /// Detaches and forgets everything about the previous session.
    pub fn close(&mut self) {
        self.reader = None;
        self.offsets = None;
    }

    pub fn is_open(&self) -> bool {
        self.reader.as_ref().is_some_and(Il2CppReader::is_open)
    }

    pub fn is_inited(&self) -> bool {
        self.offsets.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.reader.as_ref().map(Il2CppReader::pid)
    }

    /// Resolves the class anchors and every field offset the fix needs.
    ///
    /// Fails with `RuntimeStructure` while the game is still loading; it is
    /// fine to retry after a delay.
    pub fn init(&mut self) -> Result<()> {
        self.offsets = None;
        let reader = self.reader.as_mut().ok_or(Error::ProcessExited)?;

        let mut anchors = [ClassAnchor::new(NETWORK), ClassAnchor::new(PLAYER_SPOT)];
        let cached = if self.load_cache {
            self.cache.load(anchors.len())
        } else {
            None
        };
        resolve_class_anchors(reader, &mut anchors, cached.as_deref())?;

        if anchors.iter().any(|anchor| anchor.fresh) {
            if self.save_cache {
                let offsets: Vec<u64> = anchors.iter().map(|anchor| anchor.module_offset).collect();
                match self.cache.store(&offsets) {
                    Ok(()) => info!("saved class anchors to '{}'", self.cache.path().display()),
                    Err(e) => warn!(
                        "couldn't write offset cache '{}': {}",
                        self.cache.path().display(),
                        e
                    ),
                }
            }
        } else {
            info!("offset cache was fully valid, skipped the .data scan");
        }

        let cls_network = anchors[0].class_ptr;
        let cls_player_spot = anchors[1].class_ptr;

        // The static Network instance is the class's first static field;
        // cross-check that the object points back at the class.
        let inst_network = reader
            .memory()
            .read_chain::<RemotePtr>(cls_network, &[CLASS_STATIC_FIELDS, 0])?;
        if reader.object_class(inst_network) != Some(cls_network) {
            return Err(Error::RuntimeStructure(
                "Network's static instance doesn't match its class",
            ));
        }
        debug!("[Network instance: {}]", inst_network);

        // Network.localPlayer (Player) and Network.playersData
        // (List<PlayerSpot>): matched purely by declared-type structure,
        // the field names are obfuscated.
        let mut fld_local_player = None;
        let mut fld_players_data = None;
        reader.enum_fields(cls_network, MAX_CLASS_FIELDS, |r, field| {
            let Some(ty) = r.field_type(field) else {
                return false;
            };
            match ty.code() {
                TypeCode::CLASS if fld_local_player.is_none() => {
                    if r.typedef_has_id(ty.data, PLAYER) {
                        fld_local_player = Some(field.offset as u64);
                    }
                }
                TypeCode::GENERICINST if fld_players_data.is_none() => {
                    if r.generic_inst_matches(ty.data, LIST_1, &[PLAYER_SPOT]) {
                        fld_players_data = Some(field.offset as u64);
                    }
                }
                _ => {}
            }
            fld_local_player.is_none() || fld_players_data.is_none()
        });
        let fld_network_local_player =
            fld_local_player.ok_or(Error::RuntimeStructure("couldn't find Network.localPlayer"))?;
        let fld_network_players_data =
            fld_players_data.ok_or(Error::RuntimeStructure("couldn't find Network.playersData"))?;

        // Player.playerAudio, reached through the local player (which is
        // valid even in singleplayer).
        let local_player = reader
            .memory()
            .read::<RemotePtr>(inst_network.offset(fld_network_local_player))?;
        let cls_player = reader
            .object_class(local_player)
            .ok_or(Error::RuntimeStructure("couldn't resolve Player's class"))?;
        let fld_player_player_audio = find_class_typed_field(
            reader,
            cls_player,
            PLAYER_AUDIO,
            "couldn't find Player.playerAudio",
        )?;

        // PlayerAudio.walkieTalkie.
        let player_audio = reader
            .memory()
            .read::<RemotePtr>(local_player.offset(fld_player_player_audio))?;
        let cls_player_audio = reader
            .object_class(player_audio)
            .ok_or(Error::RuntimeStructure("couldn't resolve PlayerAudio's class"))?;
        let fld_player_audio_walkie_talkie = find_class_typed_field(
            reader,
            cls_player_audio,
            WALKIE_TALKIE,
            "couldn't find PlayerAudio.walkieTalkie",
        )?;

        // WalkieTalkie.isGhostSpawned: the name is obfuscated and the class
        // holds two booleans, isOn and isGhostSpawned. isOn is public,
        // isGhostSpawned is private, so the access bits disambiguate.
        // That split is an artifact of the BeeByte obfuscation observed on
        // current Unity 2022.3 builds; revisit on any game update rather
        // than trusting it as an invariant.
        let walkie_talkie = reader
            .memory()
            .read::<RemotePtr>(player_audio.offset(fld_player_audio_walkie_talkie))?;
        let cls_walkie_talkie = reader
            .object_class(walkie_talkie)
            .ok_or(Error::RuntimeStructure("couldn't resolve WalkieTalkie's class"))?;
        let mut fld_flag = None;
        reader.enum_fields(cls_walkie_talkie, MAX_CLASS_FIELDS, |r, field| {
            let Some(ty) = r.field_type(field) else {
                return false;
            };
            if ty.code() == TypeCode::BOOLEAN
                && ty.attrs() & FIELD_ACCESS_MASK == FIELD_ACCESS_PRIVATE
            {
                fld_flag = Some(field.offset as u64);
                return false;
            }
            true
        });
        let fld_walkie_talkie_is_ghost_spawned = fld_flag.ok_or(Error::RuntimeStructure(
            "couldn't find WalkieTalkie.isGhostSpawned",
        ))?;

        // PlayerSpot.player and PlayerSpot.accountName: this class's field
        // names are not obfuscated, so the name is a safe secondary check on
        // top of the type match.
        let mut fld_spot_player = None;
        let mut fld_spot_account_name = None;
        reader.enum_fields(cls_player_spot, MAX_CLASS_FIELDS, |r, field| {
            let Some(ty) = r.field_type(field) else {
                return false;
            };
            let code = ty.code();
            if code != TypeCode::CLASS && code != TypeCode::STRING {
                return true;
            }
            let Some(name) = r.field_name(field) else {
                return false;
            };
            if fld_spot_player.is_none()
                && code == TypeCode::CLASS
                && name == "player"
                && r.typedef_has_id(ty.data, PLAYER)
            {
                fld_spot_player = Some(field.offset as u64);
            } else if fld_spot_account_name.is_none()
                && code == TypeCode::STRING
                && name == "accountName"
            {
                fld_spot_account_name = Some(field.offset as u64);
            }
            fld_spot_player.is_none() || fld_spot_account_name.is_none()
        });
        let fld_player_spot_player =
            fld_spot_player.ok_or(Error::RuntimeStructure("couldn't find PlayerSpot.player"))?;
        let fld_player_spot_account_name = fld_spot_account_name.ok_or(Error::RuntimeStructure(
            "couldn't find PlayerSpot.accountName",
        ))?;

        debug!(
            "[localPlayer: {:#x}, playersData: {:#x}, playerAudio: {:#x}, walkieTalkie: {:#x}, \
             isGhostSpawned: {:#x}, player: {:#x}, accountName: {:#x}]",
            fld_network_local_player,
            fld_network_players_data,
            fld_player_player_audio,
            fld_player_audio_walkie_talkie,
            fld_walkie_talkie_is_ghost_spawned,
            fld_player_spot_player,
            fld_player_spot_account_name,
        );

        self.offsets = Some(GameOffsets {
            inst_network,
            fld_network_local_player,
            fld_network_players_data,
            fld_player_player_audio,
            fld_player_audio_walkie_talkie,
            fld_walkie_talkie_is_ghost_spawned,
            fld_player_spot_player,
            fld_player_spot_account_name,
        });
        Ok(())
    }

    /// Walks the networked players and rewrites glitched `isGhostSpawned`
    /// flags on their walkie-talkies.
    ///
    /// Note: a write can race the target's own GC; that is inherent to
    /// observing a live process and accepted.
    pub fn fix_walkie_talkies(&mut self, fix: WalkieTalkieFix) -> Result<()> {
        let reader = self.reader.as_mut().ok_or(Error::ProcessExited)?;
        let offsets = self
            .offsets
            .as_ref()
            .ok_or(Error::RuntimeStructure("offsets are not initialized"))?;

        let list_ptr = reader
            .memory()
            .read::<RemotePtr>(offsets.inst_network.offset(offsets.fld_network_players_data))?;
        let Some((player_count, spots)) = reader.generic_list_read(list_ptr, MAX_PLAYERS) else {
            return Err(Error::RuntimeStructure("couldn't read Network.playersData"));
        };

        // Empty in singleplayer; nothing to do.
        if player_count == 0 {
            return Ok(());
        }
        if player_count > MAX_PLAYERS {
            return Err(Error::RuntimeStructure(
                "Network.playersData has an impossible size",
            ));
        }

        // The local player's flag is the ground truth for Auto mode.
        let local_player = reader
            .memory()
            .read::<RemotePtr>(offsets.inst_network.offset(offsets.fld_network_local_player))?;
        let local_flag = reader.memory().read_chain::<u8>(
            local_player,
            &[
                offsets.fld_player_player_audio,
                offsets.fld_player_audio_walkie_talkie,
                offsets.fld_walkie_talkie_is_ghost_spawned,
            ],
        )? != 0;

        for (index, spot) in spots.iter().enumerate() {
            let player = reader
                .memory()
                .read::<RemotePtr>(spot.offset(offsets.fld_player_spot_player))?;
            if player == local_player {
                continue;
            }

            let walkie_talkie = reader.memory().read_chain::<RemotePtr>(
                player,
                &[
                    offsets.fld_player_player_audio,
                    offsets.fld_player_audio_walkie_talkie,
                ],
            )?;
            let is_ghost_spawned = reader
                .memory()
                .read::<u8>(walkie_talkie.offset(offsets.fld_walkie_talkie_is_ghost_spawned))?
                != 0;

            let new_value = match fix {
                WalkieTalkieFix::ForceOff => false,
                WalkieTalkieFix::ForceOn => true,
                WalkieTalkieFix::Auto => local_flag,
            };
            if is_ghost_spawned == new_value {
                continue;
            }

            // Best effort; a player without a readable name still gets fixed.
            let account_name = reader
                .memory()
                .read::<RemotePtr>(spot.offset(offsets.fld_player_spot_account_name))
                .ok()
                .and_then(|name_ptr| reader.string_read_utf8(name_ptr))
                .unwrap_or_default();

            reader.memory().write::<u8>(
                walkie_talkie.offset(offsets.fld_walkie_talkie_is_ghost_spawned),
                &(new_value as u8),
            )?;

            info!(
                "fixed the walkie-talkie of remote player {} ('{}')",
                index, account_name
            );
            debug!(
                "[remote isGhostSpawned: {} -> {}, local isGhostSpawned: {}]",
                is_ghost_spawned, new_value, local_flag
            );
        }

        Ok(())
    }
}

impl Default for PhasmoMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Finds the first field whose declared type is the given class.
fn find_class_typed_field<S: MemorySource>(
    reader: &mut Il2CppReader<S>,
    class_ptr: RemotePtr,
    field_class: Il2CppId<'static>,
    missing: &'static str,
) -> Result<u64> {
    let mut found = None;
    reader.enum_fields(class_ptr, MAX_CLASS_FIELDS, |r, field| {
        let Some(ty) = r.field_type(field) else {
            return false;
        };
        if ty.code() == TypeCode::CLASS && r.typedef_has_id(ty.data, field_class) {
            found = Some(field.offset as u64);
            return false;
        }
        true
    });
    found.ok_or(Error::RuntimeStructure(missing))
}
