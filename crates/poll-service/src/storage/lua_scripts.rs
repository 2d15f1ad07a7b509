//! Lua scripts for atomic poll writes.
//!
//! Each script touches the poll document, its owner and version keys and the
//! owner and public indexes in one atomic step, so a reader never sees a poll
//! without its index entries or an index entry pointing at a half-written poll.

/// Versioned save of a poll document.
///
/// Arguments:
/// - KEYS[1]: Poll key (`poll:{code}`)
/// - KEYS[2]: Owner key (`poll:{code}:owner`)
/// - KEYS[3]: Version key (`poll:{code}:version`)
/// - KEYS[4]: Owner index key (`owner:{owner}:polls`)
/// - KEYS[5]: Public index key (`polls:public`)
/// - ARGV[1]: Version being written
/// - ARGV[2]: Poll document (JSON string)
/// - ARGV[3]: Owner storage key
/// - ARGV[4]: Session code
/// - ARGV[5]: `1` if the poll is public, `0` otherwise
///
/// Returns:
/// - 1: Success (write completed)
/// - 0: Rejected (not newer than the stored version)
/// - -1: Error (invalid version format)
pub const SAVE_POLL: &str = r#"
local version = tonumber(ARGV[1])
if version == nil then
    return -1
end

local current = redis.call('GET', KEYS[3])
if current ~= nil and current ~= false then
    local current_version = tonumber(current)
    if current_version == nil then
        return -1
    end
    if version <= current_version then
        return 0
    end
end

redis.call('SET', KEYS[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[3])
redis.call('SET', KEYS[3], version)
redis.call('SADD', KEYS[4], ARGV[4])
if ARGV[5] == '1' then
    redis.call('SADD', KEYS[5], ARGV[4])
else
    redis.call('SREM', KEYS[5], ARGV[4])
end
return 1
"#;

/// Owner-checked delete of a poll.
///
/// Arguments:
/// - KEYS[1]: Poll key (`poll:{code}`)
/// - KEYS[2]: Owner key (`poll:{code}:owner`)
/// - KEYS[3]: Version key (`poll:{code}:version`)
/// - KEYS[4]: Owner index key for the requester
/// - KEYS[5]: Public index key (`polls:public`)
/// - ARGV[1]: Requester storage key
/// - ARGV[2]: Session code
///
/// Returns:
/// - 1: Deleted
/// - 0: No such poll
/// - -1: Requester does not own the poll
pub const DELETE_POLL: &str = r#"
local owner = redis.call('GET', KEYS[2])
if owner == nil or owner == false then
    return 0
end

if owner ~= ARGV[1] then
    return -1
end

redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
redis.call('SREM', KEYS[4], ARGV[2])
redis.call('SREM', KEYS[5], ARGV[2])
return 1
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_reference_all_keys() {
        for key in ["KEYS[1]", "KEYS[2]", "KEYS[3]", "KEYS[4]", "KEYS[5]"] {
            assert!(SAVE_POLL.contains(key), "SAVE_POLL missing {key}");
            assert!(DELETE_POLL.contains(key), "DELETE_POLL missing {key}");
        }
    }

    #[test]
    fn test_save_rejects_equal_versions() {
        assert!(SAVE_POLL.contains("version <= current_version"));
    }

    #[test]
    fn test_delete_checks_owner_before_deleting() {
        let owner_check = DELETE_POLL.find("owner ~= ARGV[1]");
        let delete = DELETE_POLL.find("'DEL'");
        assert!(owner_check.is_some() && delete.is_some());
        assert!(owner_check < delete);
    }
}
